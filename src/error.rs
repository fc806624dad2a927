use core::fmt;

////////////////////////////////////////////////////////////////////////////////////////////////////
// NoFreeSlotError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type for failed attempts at registering a thread with a hazard
/// registry whose slots are all claimed by other threads.
///
/// The error is only fatal to the thread that encountered it, every thread
/// which already owns a slot is unaffected.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct NoFreeSlotError;

/********** impl Display **************************************************************************/

impl fmt::Display for NoFreeSlotError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no free hazard pointer slot left for the current thread")
    }
}

/********** impl Error ****************************************************************************/

impl std::error::Error for NoFreeSlotError {}
