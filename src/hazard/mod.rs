//! The hazard slot registry.
//!
//! A registry is a fixed-capacity table in which every participating thread
//! claims exactly one [`HazardSlot`].
//! Before a thread dereferences a node that another thread might unlink and
//! free concurrently, it publishes the node's address in its slot.
//! A thread that has unlinked a node may only free it once a scan over all
//! slots ([`anyone_holds`]) finds no matching publication.
//!
//! # Publication protocol
//!
//! Readers use the classic publish-and-validate sequence: load the shared
//! location, publish the loaded address (a relaxed store followed by a
//! sequentially consistent fence), re-load the location and start over if it
//! changed.
//! Scans are preceded by a sequentially consistent fence as well, so a
//! scanning thread that has already unlinked a node either observes the
//! publication or the reader's validating re-load observes the unlink.
//!
//! # Thread lifecycle
//!
//! The process-wide registry has [`CAPACITY`] slots.
//! A thread claims one with [`acquire`] (idempotent) and gives it back with
//! [`release`]; the [`ThreadContext`](crate::ThreadContext) wrapper pairs the
//! two calls.
//! Threads that terminate without calling [`release`] have their slot released
//! by a thread-local destructor.
//!
//! [`acquire`] hands out a [`HazardHandle`], which is bound to the claiming
//! thread and only ever publishes to (or clears) its slot while that thread
//! still owns it.
//! A handle outliving a [`release`] is inert, even if the slot has been
//! claimed by another thread in the meantime.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{self, Ordering};

use log::warn;

use crate::align::CachePadded;
use crate::error::NoFreeSlotError;

mod slot;

pub use self::slot::{HazardSlot, ThreadToken};

/// The number of slots in the process-wide registry, i.e. the maximum number
/// of threads that can concurrently pop from hazard pointer based stacks.
pub const CAPACITY: usize = 128;

static GLOBAL: HazardRegistry<CAPACITY> = HazardRegistry::new();

thread_local!(static LOCAL: LocalSlot = const { LocalSlot::new() });

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardRegistry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-capacity table of [`HazardSlot`]s.
pub struct HazardRegistry<const CAP: usize> {
    slots: [CachePadded<HazardSlot>; CAP],
}

/********** impl inherent *************************************************************************/

impl<const CAP: usize> HazardRegistry<CAP> {
    /// Creates a new registry with `CAP` unclaimed slots.
    #[inline]
    pub const fn new() -> Self {
        Self { slots: [const { CachePadded::new(HazardSlot::new()) }; CAP] }
    }

    /// Returns the fixed number of slots.
    #[inline]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Claims the first unclaimed slot for `token`, scanning the table
    /// linearly.
    ///
    /// # Errors
    ///
    /// Fails with [`NoFreeSlotError`] if every slot is claimed.
    #[inline]
    pub fn claim(&self, token: ThreadToken) -> Result<usize, NoFreeSlotError> {
        self.slots.iter().position(|slot| slot.try_claim(token)).ok_or_else(|| {
            warn!("hazard registry exhausted: all {} slots are claimed", CAP);
            NoFreeSlotError
        })
    }

    /// Returns a reference to the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn slot(&self, index: usize) -> &HazardSlot {
        &self.slots[index]
    }

    /// Releases the slot at `index`, clearing both the published address and
    /// the owner identity.
    #[inline]
    pub fn release(&self, index: usize) {
        self.slots[index].release();
    }

    /// Returns `true` if any slot currently publishes `addr`.
    ///
    /// This is a linear scan over the entire table.
    #[inline]
    pub fn anyone_holds(&self, addr: *const ()) -> bool {
        atomic::fence(Ordering::SeqCst);
        self.slots.iter().any(|slot| slot.protects(addr))
    }

    /// Returns the number of currently claimed slots.
    #[inline]
    pub fn claimed(&self) -> usize {
        self.slots.iter().filter(|slot| slot.owner().is_some()).count()
    }
}

/********** impl Default **************************************************************************/

impl<const CAP: usize> Default for HazardRegistry<CAP> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// process-wide registry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Returns a handle to the slot of the current thread in the process-wide
/// registry, claiming one on first use.
///
/// Once claimed, the slot is cached for the current thread until [`release`]
/// is called or the thread terminates.
///
/// # Errors
///
/// Fails with [`NoFreeSlotError`] if all [`CAPACITY`] slots are claimed by
/// other threads or if the thread's local storage has already been torn down.
#[inline]
pub fn acquire() -> Result<HazardHandle, NoFreeSlotError> {
    LOCAL.try_with(|local| local.acquire()).map_err(|_| NoFreeSlotError)?
}

/// Releases the current thread's slot in the process-wide registry, if it has
/// one.
///
/// The next call to [`acquire`] on this thread claims a (potentially
/// different) slot again.
#[inline]
pub fn release() {
    let _ = LOCAL.try_with(|local| local.release());
}

/// Returns `true` if any thread currently publishes `addr` in the process-wide
/// registry.
#[inline]
pub fn anyone_holds(addr: *const ()) -> bool {
    GLOBAL.anyone_holds(addr)
}

/// Returns the number of currently claimed slots in the process-wide registry.
#[inline]
pub fn claimed_slots() -> usize {
    GLOBAL.claimed()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The current thread's access to its claimed [`HazardSlot`].
///
/// A handle can not be sent to other threads.
/// It only publishes or clears addresses while the slot is still claimed
/// under the token it was created with, so a handle obtained before a
/// [`release`] can no longer interfere with a later owner of the same slot.
#[derive(Debug)]
pub struct HazardHandle {
    slot: &'static HazardSlot,
    token: ThreadToken,
    _marker: PhantomData<*mut ()>,
}

/********** impl inherent *************************************************************************/

impl HazardHandle {
    #[inline]
    pub(crate) fn new(slot: &'static HazardSlot, token: ThreadToken) -> Self {
        Self { slot, token, _marker: PhantomData }
    }

    /// Returns `true` if the slot is still claimed by the thread that created
    /// this handle.
    #[inline]
    pub fn is_claimed(&self) -> bool {
        // the owner can only change away from this token through a release
        // on the very thread holding the handle
        self.slot.owner() == Some(self.token.get())
    }

    /// Publishes `addr` as hazardous and returns `true`, or returns `false`
    /// without publishing anything if the slot has been released.
    #[inline]
    pub fn protect<T>(&self, addr: *const T) -> bool {
        let claimed = self.is_claimed();
        if claimed {
            self.slot.protect(addr);
        }

        claimed
    }

    /// Retracts the published address and returns `true`, or returns `false`
    /// without touching the slot if it has been released.
    #[inline]
    pub fn clear(&self) -> bool {
        let claimed = self.is_claimed();
        if claimed {
            self.slot.clear();
        }

        claimed
    }

    /// Returns the underlying slot.
    #[inline]
    pub fn slot(&self) -> &'static HazardSlot {
        self.slot
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-thread cache of the claimed slot index.
struct LocalSlot {
    index: Cell<Option<usize>>,
    token: Cell<Option<ThreadToken>>,
}

/********** impl inherent *************************************************************************/

impl LocalSlot {
    #[inline]
    const fn new() -> Self {
        Self { index: Cell::new(None), token: Cell::new(None) }
    }

    #[inline]
    fn acquire(&self) -> Result<HazardHandle, NoFreeSlotError> {
        let token = match self.token.get() {
            Some(token) => token,
            None => {
                let token = ThreadToken::next();
                self.token.set(Some(token));
                token
            }
        };

        let index = match self.index.get() {
            Some(index) => index,
            None => {
                let index = GLOBAL.claim(token)?;
                self.index.set(Some(index));
                index
            }
        };

        Ok(HazardHandle::new(GLOBAL.slot(index), token))
    }

    #[inline]
    fn release(&self) {
        if let Some(index) = self.index.take() {
            GLOBAL.release(index);
        }
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for LocalSlot {
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}
