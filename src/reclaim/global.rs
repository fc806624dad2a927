use log::trace;

use crate::hazard;
use crate::reclaim::{self, AtomicList};
use crate::retired::Retired;
use crate::Reclaim;

/// The process-wide list of deferred entries shared by all threads.
static DEFERRED: AtomicList = AtomicList::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Global
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Reclamation through a single shared list of deferred entries.
///
/// A retired record is freed right away if no thread publishes its address,
/// otherwise it is linked into the shared list.
/// Every reclamation attempt drains the entire list, frees whatever has
/// become safe and links the remainder back in, so the scan cost is paid on
/// every pop.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Global;

/********** impl Reclaim **************************************************************************/

unsafe impl Reclaim for Global {
    #[inline]
    unsafe fn retire(retired: Retired) {
        if !hazard::anyone_holds(retired.as_ptr()) {
            retired.reclaim();
            return;
        }

        if let Some(entry) = reclaim::defer(retired) {
            DEFERRED.push(entry);
        }
    }

    #[inline]
    fn try_reclaim() {
        DEFERRED.reclaim_unprotected();
    }

    #[inline]
    fn flush() -> usize {
        let (freed, remaining) = DEFERRED.reclaim_unprotected();
        trace!("flushed shared reclaim list: {} freed, {} still hazardous", freed, remaining);
        remaining
    }
}
