//! The explicit lifecycle of a thread's participation in hazard pointer based
//! reclamation.
//!
//! Hazard stacks claim a registry slot lazily on the first pop and keep it
//! until the thread terminates.
//! Threads that only work on a stack for a part of their lifetime (e.g. pooled
//! worker threads) should instead wrap that work in a [`ThreadContext`], so
//! the slot is made available to other threads and all of the thread's
//! pending deferred entries are handed over as soon as the work is done.

use core::cell::Cell;
use core::marker::PhantomData;

use crate::error::NoFreeSlotError;
use crate::hazard;
use crate::reclaim::Local;

thread_local!(static DEPTH: Cell<usize> = const { Cell::new(0) });

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadContext
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A guard for the current thread's claim on a hazard registry slot.
///
/// Contexts can be nested, only dropping the outermost one releases the slot
/// and hands the thread's deferred entries over to the shared overflow list.
/// A context is bound to the thread that entered it.
#[derive(Debug)]
pub struct ThreadContext {
    _marker: PhantomData<*mut ()>,
}

/********** impl inherent *************************************************************************/

impl ThreadContext {
    /// Enters a new context, claiming a registry slot for the current thread
    /// unless it already owns one.
    ///
    /// # Errors
    ///
    /// Fails with [`NoFreeSlotError`] if all registry slots are claimed by
    /// other threads.
    #[inline]
    pub fn enter() -> Result<Self, NoFreeSlotError> {
        hazard::acquire()?;
        DEPTH.try_with(|depth| depth.set(depth.get() + 1)).map_err(|_| NoFreeSlotError)?;

        Ok(Self { _marker: PhantomData })
    }

    /// Returns the number of contexts the current thread has currently
    /// entered.
    #[inline]
    pub fn depth() -> usize {
        DEPTH.try_with(Cell::get).unwrap_or(0)
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for ThreadContext {
    #[inline]
    fn drop(&mut self) {
        let outermost = DEPTH
            .try_with(|depth| {
                let remaining = depth.get() - 1;
                depth.set(remaining);
                remaining == 0
            })
            .unwrap_or(true);

        if outermost {
            hazard::release();
            Local::hand_off();
        }
    }
}

/// Runs `f` inside a [`ThreadContext`].
///
/// # Errors
///
/// Fails with [`NoFreeSlotError`] without running `f` if no registry slot
/// could be claimed.
#[inline]
pub fn scope<F, R>(f: F) -> Result<R, NoFreeSlotError>
where
    F: FnOnce() -> R,
{
    let _context = ThreadContext::enter()?;
    Ok(f())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::ThreadContext;
    use crate::hazard;

    #[test]
    fn enter_and_leave() {
        thread::spawn(|| {
            let context = ThreadContext::enter().unwrap();
            assert_eq!(1, ThreadContext::depth());

            let handle = hazard::acquire().unwrap();
            assert!(handle.is_claimed());

            drop(context);
            assert_eq!(0, ThreadContext::depth());
            assert!(!handle.is_claimed());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn nested() {
        thread::spawn(|| {
            let outer = ThreadContext::enter().unwrap();
            let handle = hazard::acquire().unwrap();

            let inner = ThreadContext::enter().unwrap();
            assert_eq!(2, ThreadContext::depth());
            drop(inner);

            // the outer context still owns the slot
            assert!(handle.is_claimed());
            assert_eq!(1, ThreadContext::depth());

            drop(outer);
            assert!(!handle.is_claimed());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scope() {
        let depth = thread::spawn(|| super::scope(ThreadContext::depth).unwrap()).join().unwrap();
        assert_eq!(1, depth);
    }
}
