//! Deferred reclamation of unlinked records that may still be hazardous.
//!
//! A record that has been unlinked from a data structure while some thread
//! still publishes its address in the hazard registry can not be freed right
//! away.
//! Instead it is wrapped in a [`Deferred`] entry and queued in a reclaim list
//! until a later scan finds no matching hazard.
//!
//! Two flavors are provided:
//!
//! - [`Global`]: a single process-wide list, updated with CAS and drained
//!   wholesale by whichever thread attempts a reclamation.
//! - [`Local`]: a private list per thread, only scanned once it has grown to
//!   the registry's capacity, plus a shared overflow list that receives the
//!   entries of terminating threads for adoption by the survivors.

use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc;

use crate::hazard;
use crate::retired::Retired;

mod global;
mod list;
mod local;

pub use self::global::Global;
pub use self::local::{Local, SCAN_THRESHOLD};

pub(crate) use self::list::{AtomicList, Chain};

/// The number of deferred entries that could not be allocated, for
/// diagnostics only.
static ALLOC_FAILURES: AtomicUsize = AtomicUsize::new(0);

/// Returns how often the allocation of a deferred entry has failed so far.
///
/// Each failure was resolved either by freeing the record immediately or by
/// retrying the allocation.
#[inline]
pub fn deferred_alloc_failures() -> usize {
    ALLOC_FAILURES.load(Ordering::Relaxed)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Deferred
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A reclaim list entry, exclusively owning one retired record.
pub(crate) struct Deferred {
    retired: Retired,
    next: *mut Deferred,
}

/********** impl inherent *************************************************************************/

impl Deferred {
    /// Attempts to allocate a new (unlinked) entry for `retired`.
    ///
    /// # Errors
    ///
    /// Hands `retired` back to the caller if the allocation fails.
    #[inline]
    pub fn try_new(retired: Retired) -> Result<NonNull<Self>, Retired> {
        let layout = Layout::new::<Self>();
        // entries are never zero-sized
        let raw = unsafe { alloc::alloc(layout) } as *mut Self;
        match NonNull::new(raw) {
            Some(entry) => {
                unsafe { entry.as_ptr().write(Self { retired, next: ptr::null_mut() }) };
                Ok(entry)
            }
            None => Err(retired),
        }
    }

    /// Returns the address of the retired record owned by `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live entry.
    #[inline]
    pub unsafe fn address(entry: NonNull<Self>) -> *const () {
        (*entry.as_ptr()).retired.as_ptr()
    }

    /// Reclaims the retired record and frees the entry itself.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live entry that is not linked into any list and
    /// the retired record must no longer be hazardous.
    #[inline]
    pub unsafe fn reclaim(entry: NonNull<Self>) {
        let Deferred { retired, .. } = *Box::from_raw(entry.as_ptr());
        retired.reclaim();
    }
}

/// Wraps `retired` in a deferred entry.
///
/// If the allocation of the entry fails, the record is freed right away when
/// no hazard is published for it, otherwise the allocation is retried.
/// Returns `None` if the record has been freed.
#[inline]
pub(crate) fn defer(retired: Retired) -> Option<NonNull<Deferred>> {
    defer_with(retired, Deferred::try_new)
}

#[inline]
fn defer_with<F>(mut retired: Retired, mut alloc: F) -> Option<NonNull<Deferred>>
where
    F: FnMut(Retired) -> Result<NonNull<Deferred>, Retired>,
{
    loop {
        match alloc(retired) {
            Ok(entry) => return Some(entry),
            Err(record) => {
                ALLOC_FAILURES.fetch_add(1, Ordering::Relaxed);
                if !hazard::anyone_holds(record.as_ptr()) {
                    unsafe { record.reclaim() };
                    return None;
                }

                retired = record;
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::Deferred;
    use crate::hazard;
    use crate::retired::Retired;

    pub(crate) struct DropCount(pub Arc<AtomicUsize>);

    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn retired(count: &Arc<AtomicUsize>) -> Retired {
        let raw = Box::into_raw(Box::new(DropCount(Arc::clone(count))));
        unsafe { Retired::new_unchecked(NonNull::new_unchecked(raw)) }
    }

    #[test]
    fn deferred_entry() {
        let count = Arc::new(AtomicUsize::new(0));
        let record = retired(&count);
        let address = record.as_ptr();

        let entry = Deferred::try_new(record).unwrap_or_else(|_| panic!("allocation failed"));
        assert_eq!(address, unsafe { Deferred::address(entry) });
        assert_eq!(0, count.load(Ordering::Relaxed));

        unsafe { Deferred::reclaim(entry) };
        assert_eq!(1, count.load(Ordering::Relaxed));
    }

    #[test]
    fn defer() {
        let count = Arc::new(AtomicUsize::new(0));
        let entry = super::defer(retired(&count)).expect("allocation does not fail here");
        unsafe { Deferred::reclaim(entry) };
        assert_eq!(1, count.load(Ordering::Relaxed));
    }

    #[test]
    fn alloc_failure_unprotected() {
        let count = Arc::new(AtomicUsize::new(0));
        let failures = super::deferred_alloc_failures();

        let entry = super::defer_with(retired(&count), Err);
        assert!(entry.is_none());
        assert_eq!(1, count.load(Ordering::Relaxed));
        assert!(super::deferred_alloc_failures() > failures);
    }

    #[test]
    fn alloc_failure_protected() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            let record = retired(&count);
            let failures = super::deferred_alloc_failures();

            let handle = hazard::acquire().unwrap();
            assert!(handle.protect(record.as_ptr()));

            // the record is hazardous, so every failure is followed by a retry
            let mut attempts = 0;
            let entry = super::defer_with(record, |record| {
                attempts += 1;
                match attempts {
                    1..=3 => Err(record),
                    _ => Deferred::try_new(record),
                }
            });

            assert_eq!(4, attempts);
            assert_eq!(0, count.load(Ordering::Relaxed));
            assert!(super::deferred_alloc_failures() >= failures + 3);

            let entry = entry.unwrap_or_else(|| panic!("hazardous record was freed"));
            assert!(handle.clear());
            unsafe { Deferred::reclaim(entry) };
            assert_eq!(1, count.load(Ordering::Relaxed));
            hazard::release();
        })
        .join()
        .unwrap();
    }
}
