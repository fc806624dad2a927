use core::fmt;
use core::num::NonZeroU64;
use core::ptr;
use core::sync::atomic::{self, AtomicPtr, AtomicU64, Ordering};

use Ordering::{Acquire, Relaxed, Release, SeqCst};

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadToken
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A process-wide unique, non-zero identity of a thread as seen by a hazard
/// registry.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadToken(NonZeroU64);

/********** impl inherent *************************************************************************/

impl ThreadToken {
    /// Hands out a fresh token that has never been returned before.
    #[inline]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT.fetch_add(1, Relaxed);
        // 2^64 tokens can not be exhausted in practice
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Returns the integer representation of the token.
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single entry of a hazard registry, consisting of the identity of the
/// owning thread and the one address this thread has published as hazardous.
///
/// An owner of `0` marks the slot as unclaimed.
pub struct HazardSlot {
    owner: AtomicU64,
    hazard: AtomicPtr<()>,
}

/********** impl inherent *************************************************************************/

impl HazardSlot {
    /// Creates a new unclaimed slot.
    #[inline]
    pub const fn new() -> Self {
        Self { owner: AtomicU64::new(0), hazard: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Publishes `addr` as hazardous, i.e. announces that the owning thread
    /// is about to dereference it.
    ///
    /// The publication is followed by a full fence, so any load issued after
    /// this call (e.g. re-reading the location `addr` was loaded from) is
    /// ordered after the publication becomes visible to scanning threads.
    #[inline]
    pub(crate) fn protect<T>(&self, addr: *const T) {
        self.hazard.store(addr as *mut (), Relaxed);
        atomic::fence(SeqCst);
    }

    /// Retracts any previously published address.
    #[inline]
    pub(crate) fn clear(&self) {
        self.hazard.store(ptr::null_mut(), Release);
    }

    /// Returns the currently published address or `null`.
    #[inline]
    pub fn hazard(&self) -> *const () {
        self.hazard.load(Acquire)
    }

    /// Returns `true` if the slot is currently published to protect `addr`.
    #[inline]
    pub fn protects(&self, addr: *const ()) -> bool {
        !addr.is_null() && self.hazard() == addr
    }

    /// Returns the token of the owning thread, if the slot is claimed.
    #[inline]
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Relaxed) {
            0 => None,
            owner => Some(owner),
        }
    }

    /// Attempts to claim the slot for `token` through a single CAS on the
    /// identity field.
    #[inline]
    pub(crate) fn try_claim(&self, token: ThreadToken) -> bool {
        self.owner.load(Relaxed) == 0
            && self.owner.compare_exchange(0, token.get(), Acquire, Relaxed).is_ok()
    }

    /// Resets both the published address and the identity field.
    #[inline]
    pub(crate) fn release(&self) {
        self.hazard.store(ptr::null_mut(), Release);
        self.owner.store(0, Release);
    }
}

/********** impl Default **************************************************************************/

impl Default for HazardSlot {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for HazardSlot {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardSlot")
            .field("owner", &self.owner())
            .field("hazard", &self.hazard())
            .finish()
    }
}
