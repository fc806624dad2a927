//! Lock-free LIFO stacks and the memory reclamation schemes that make them
//! safe.
//!
//! Pushing onto Treiber's stack is a simple CAS loop.
//! Popping is just as simple, except for the question of when the memory of
//! a popped node may be released while other threads could still be about
//! to read it.
//! This crate provides two stacks that answer this question differently:
//!
//! - [`HazardStack`] publishes the node a thread is about to access in a
//!   process-wide [hazard registry](hazard) and only frees popped nodes that
//!   no thread has published.
//!   Popped nodes that are still protected are deferred, either in one shared
//!   list ([`Global`]) or in thread-local lists that are scanned in batches
//!   ([`Local`]).
//! - [`CountedStack`] embeds an external reference counter in its head word
//!   and an internal counter in each node, freeing every node exactly when
//!   the last thread referencing it lets go.
//!
//! Both implement the common [`ConcurrentStack`] interface.
//!
//! # Thread registration
//!
//! The hazard registry has a fixed number of [slots](hazard::CAPACITY).
//! A thread claims one on its first pop from a [`HazardStack`] and keeps it
//! until it terminates, unless the work is scoped by a [`ThreadContext`].
//!
//! # Examples
//!
//! ```
//! use reclaim_stack::{ConcurrentStack, CountedStack, HazardStack};
//!
//! let stack: HazardStack<i32> = HazardStack::new();
//! stack.push(50);
//! stack.push(89);
//! assert_eq!(stack.pop(), Some(89));
//! assert_eq!(stack.pop(), Some(50));
//! assert_eq!(stack.pop(), None);
//!
//! let stack: Box<dyn ConcurrentStack<String>> = Box::new(CountedStack::<String>::new());
//! stack.push(String::from("counted"));
//! assert_eq!(stack.pop().as_deref(), Some("counted"));
//! ```

#![warn(missing_docs)]

pub use typenum;

pub mod align;
pub mod context;
#[cfg(target_has_atomic = "64")]
mod counted;
mod error;
pub mod hazard;
mod hazard_stack;
mod reclaim;
mod retired;

pub use crate::context::ThreadContext;
#[cfg(target_has_atomic = "64")]
pub use crate::counted::{AtomicCountedRef, CountedRef, CountedStack, CounterWidth};
pub use crate::error::NoFreeSlotError;
pub use crate::hazard_stack::HazardStack;
pub use crate::reclaim::{deferred_alloc_failures, Global, Local, SCAN_THRESHOLD};
pub use crate::retired::Retired;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Reclaim (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A strategy for disposing of records that have been unlinked from a
/// hazard pointer protected data structure.
///
/// # Safety
///
/// Implementors must never free a retired record while any thread publishes
/// its address in the hazard registry and must free every retired record
/// eventually, i.e. once it is no longer published and a later reclamation
/// attempt (or the termination of the retiring thread) occurs.
pub unsafe trait Reclaim: Sized + 'static {
    /// Hands an unlinked record over for reclamation, which is either
    /// immediate or deferred.
    ///
    /// # Safety
    ///
    /// The record must be unlinked, i.e. no new references to it can be
    /// obtained by any thread, and it must not be retired twice.
    unsafe fn retire(retired: Retired);

    /// Attempts to free deferred records that are no longer hazardous.
    ///
    /// Implementations may decide to postpone the actual attempt in order to
    /// amortize its cost.
    fn try_reclaim();

    /// Unconditionally frees all deferred records visible to the current
    /// thread that are no longer hazardous.
    ///
    /// Returns the number of records that remain deferred.
    fn flush() -> usize;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConcurrentStack (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The common interface of the lock-free stacks.
pub trait ConcurrentStack<T>: Send + Sync {
    /// Pushes an already heap allocated element on top of the stack.
    fn push_boxed(&self, elem: Box<T>);

    /// Pops the topmost element in the allocation it was pushed in or
    /// returns `None` if the stack is empty.
    fn pop_boxed(&self) -> Option<Box<T>>;

    /// Returns `true` if the stack was empty at the time of the check.
    fn is_empty(&self) -> bool;

    /// Pushes `elem` on top of the stack.
    #[inline]
    fn push(&self, elem: T) {
        self.push_boxed(Box::new(elem));
    }

    /// Pops the topmost element or returns `None` if the stack is empty.
    #[inline]
    fn pop(&self) -> Option<T> {
        self.pop_boxed().map(|elem| *elem)
    }
}
