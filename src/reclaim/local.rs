use core::cell::RefCell;

use log::{debug, trace};

use crate::hazard;
use crate::reclaim::{self, AtomicList, Chain};
use crate::retired::Retired;
use crate::Reclaim;

/// The number of entries a thread-local list has to hold before a reclamation
/// attempt actually scans the hazard registry.
pub const SCAN_THRESHOLD: usize = hazard::CAPACITY;

/// Entries left behind by terminated threads, adopted by whichever thread
/// attempts a reclamation next.
static OVERFLOW: AtomicList = AtomicList::new();

thread_local!(static DEFERRED: LocalList = const { LocalList::new() });

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Reclamation through thread-local lists of deferred entries.
///
/// Retired records are always queued in the current thread's private list.
/// A reclamation attempt first adopts all entries in the shared overflow list
/// and only scans the hazard registry once the private list has reached
/// [`SCAN_THRESHOLD`] entries, which spreads the cost of one scan over many
/// pops.
///
/// When a thread leaves its [`ThreadContext`](crate::ThreadContext) or
/// terminates, whatever could not be freed at that point is handed over to
/// the overflow list.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Local;

/********** impl inherent *************************************************************************/

impl Local {
    /// Scans the current thread's deferred entries once and hands all
    /// entries that are still hazardous over to the shared overflow list.
    #[inline]
    pub fn hand_off() {
        let _ = DEFERRED.try_with(|list| hand_off(list.take()));
    }

    /// Returns the number of entries currently deferred by this thread.
    #[inline]
    pub fn pending() -> usize {
        DEFERRED.try_with(|list| list.chain.borrow().len()).unwrap_or(0)
    }

    /// Adopts the overflow list and scans the combined list if it holds at
    /// least `threshold` entries.
    ///
    /// Returns the number of entries still deferred afterwards.
    #[inline]
    fn reclaim_at(threshold: usize) -> usize {
        DEFERRED
            .try_with(|list| {
                let mut chain = list.take();
                if !OVERFLOW.is_empty() {
                    let adopted = OVERFLOW.take();
                    if !adopted.is_empty() {
                        debug!("adopting {} deferred entries from the overflow list", adopted.len());
                        chain.append(adopted);
                    }
                }

                if chain.len() >= threshold {
                    chain.reclaim_unprotected();
                }

                let remaining = chain.len();
                list.restore(chain);
                remaining
            })
            // thread-local storage is gone, only the overflow list is left
            .unwrap_or_else(|_| OVERFLOW.reclaim_unprotected().1)
    }
}

/********** impl Reclaim **************************************************************************/

unsafe impl Reclaim for Local {
    #[inline]
    unsafe fn retire(retired: Retired) {
        if let Some(entry) = reclaim::defer(retired) {
            if DEFERRED.try_with(|list| list.chain.borrow_mut().push(entry)).is_err() {
                OVERFLOW.push(entry);
            }
        }
    }

    #[inline]
    fn try_reclaim() {
        Self::reclaim_at(SCAN_THRESHOLD);
    }

    #[inline]
    fn flush() -> usize {
        let remaining = Self::reclaim_at(0);
        trace!("flushed thread-local reclaim list: {} still hazardous", remaining);
        remaining
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-thread list of deferred entries.
struct LocalList {
    chain: RefCell<Chain>,
}

/********** impl inherent *************************************************************************/

impl LocalList {
    #[inline]
    const fn new() -> Self {
        Self { chain: RefCell::new(Chain::new()) }
    }

    #[inline]
    fn take(&self) -> Chain {
        self.chain.borrow_mut().take()
    }

    #[inline]
    fn restore(&self, chain: Chain) {
        self.chain.borrow_mut().append(chain);
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for LocalList {
    #[inline]
    fn drop(&mut self) {
        hand_off(self.chain.get_mut().take());
    }
}

#[inline]
fn hand_off(mut chain: Chain) {
    if chain.is_empty() {
        return;
    }

    chain.reclaim_unprotected();
    if !chain.is_empty() {
        debug!("handing {} deferred entries over to the overflow list", chain.len());
        OVERFLOW.push_chain(chain);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::{Local, SCAN_THRESHOLD};
    use crate::hazard;
    use crate::reclaim::tests::retired;
    use crate::Reclaim;

    #[test]
    fn amortized_scan() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            for _ in 0..SCAN_THRESHOLD - 1 {
                unsafe { Local::retire(retired(&count)) };
            }

            assert_eq!(0, count.load(Ordering::Relaxed));
            assert_eq!(SCAN_THRESHOLD - 1, Local::pending());

            unsafe { Local::retire(retired(&count)) };
            Local::try_reclaim();
            assert_eq!(SCAN_THRESHOLD, count.load(Ordering::Relaxed));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn below_threshold_keeps_entries() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            for _ in 0..3 {
                unsafe { Local::retire(retired(&count)) };
            }

            Local::try_reclaim();
            // adopted overflow entries may push the list over the threshold
            assert!(count.load(Ordering::Relaxed) == 3 || Local::pending() >= 3);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn flush_ignores_threshold() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            for _ in 0..3 {
                unsafe { Local::retire(retired(&count)) };
            }

            // adopted overflow entries of other threads may still be hazardous
            let remaining = Local::flush();
            assert_eq!(remaining, Local::pending());
            assert_eq!(3, count.load(Ordering::Relaxed));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn hand_off_keeps_hazardous() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            let protected = retired(&count);
            let slot = hazard::acquire().unwrap();
            slot.protect(protected.as_ptr());

            unsafe {
                Local::retire(protected);
                Local::retire(retired(&count));
            }

            Local::hand_off();
            assert_eq!(0, Local::pending());
            assert_eq!(1, count.load(Ordering::Relaxed));

            slot.clear();
            hazard::release();

            // the entry now sits in the overflow list, possibly adopted by
            // another thread in the meantime
            while count.load(Ordering::Relaxed) < 2 {
                Local::flush();
                thread::yield_now();
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn thread_exit_hands_off() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        thread::spawn(move || {
            for _ in 0..5 {
                unsafe { Local::retire(retired(&inner)) };
            }
            assert_eq!(5, Local::pending());
        })
        .join()
        .unwrap();

        // nothing was protected, so the exiting thread's final scan frees all
        assert_eq!(5, count.load(Ordering::Relaxed));
    }
}
