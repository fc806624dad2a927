//! Treiber's stack, made memory safe through hazard pointers.

use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(test)]
use std::sync::Arc;

use Ordering::{Acquire, Relaxed, Release};

use crate::align::CachePadded;
use crate::error::NoFreeSlotError;
use crate::hazard;
use crate::reclaim::Local;
use crate::retired::Retired;
use crate::{ConcurrentStack, Reclaim};

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack whose popped nodes are reclaimed through the
/// process-wide hazard registry.
///
/// The reclamation flavor `R` decides what happens to popped nodes that are
/// still protected by other threads: [`Local`] (the default) batches them in
/// thread-local lists, [`Global`](crate::Global) queues them in one shared
/// list.
///
/// Pushing never requires a registry slot, popping claims one for the
/// current thread on first use.
pub struct HazardStack<T, R: Reclaim = Local> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    #[cfg(test)]
    stats: Arc<NodeStats>,
    _marker: PhantomData<(Box<Node<T>>, R)>,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send, R: Reclaim> Send for HazardStack<T, R> {}
unsafe impl<T: Send, R: Reclaim> Sync for HazardStack<T, R> {}

/********** impl inherent *************************************************************************/

impl<T, R: Reclaim> HazardStack<T, R> {
    /// Creates a new empty stack.
    #[cfg(not(test))]
    #[inline]
    pub const fn new() -> Self {
        Self { head: CachePadded::new(AtomicPtr::new(ptr::null_mut())), _marker: PhantomData }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            stats: Arc::default(),
            _marker: PhantomData,
        }
    }

    /// Returns `true` if the stack was empty at the time of the check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }

    /// Pushes `elem` on top of the stack.
    #[inline]
    pub fn push(&self, elem: T) {
        self.push_boxed(Box::new(elem));
    }

    /// Pushes the already heap allocated `elem` on top of the stack without
    /// moving it out of its allocation.
    #[inline]
    pub fn push_boxed(&self, elem: Box<T>) {
        let node = Box::into_raw(Box::new(self.node(elem)));
        let mut head = self.head.load(Relaxed);

        loop {
            unsafe { (*node).next = head };
            // (HAZ:1) this `Release` CAS synchronizes-with the `Acquire` load in (HAZ:2)
            match self.head.compare_exchange_weak(head, node, Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the topmost element from the stack.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not own a hazard registry slot and
    /// none is left to be claimed.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.pop_boxed().map(|elem| *elem)
    }

    /// Pops the topmost element from the stack in the allocation it was
    /// pushed in.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not own a hazard registry slot and
    /// none is left to be claimed.
    #[inline]
    pub fn pop_boxed(&self) -> Option<Box<T>> {
        self.try_pop_boxed().unwrap_or_else(|err| panic!("{}", err))
    }

    /// Pops the topmost element from the stack.
    ///
    /// # Errors
    ///
    /// Fails with [`NoFreeSlotError`] if the current thread does not own a
    /// hazard registry slot and none is left to be claimed.
    #[inline]
    pub fn try_pop(&self) -> Result<Option<T>, NoFreeSlotError> {
        self.try_pop_boxed().map(|elem| elem.map(|elem| *elem))
    }

    /// Pops the topmost element from the stack in the allocation it was
    /// pushed in.
    ///
    /// # Errors
    ///
    /// Fails with [`NoFreeSlotError`] if the current thread does not own a
    /// hazard registry slot and none is left to be claimed.
    pub fn try_pop_boxed(&self) -> Result<Option<Box<T>>, NoFreeSlotError> {
        let handle = hazard::acquire()?;
        // the slot can only be released by this thread, so it stays claimed
        // for the entire pop
        let slot = handle.slot();
        let mut head = self.head.load(Acquire);

        let node = loop {
            // publish the observed head and validate that it is still current,
            // a protected node can not be freed (or re-used for a new push)
            let node = loop {
                if head.is_null() {
                    slot.clear();
                    return Ok(None);
                }

                slot.protect(head);
                // (HAZ:2) this `Acquire` load synchronizes-with the `Release` CAS in (HAZ:1)
                let reloaded = self.head.load(Acquire);
                if reloaded == head {
                    break head;
                }

                head = reloaded;
            };

            let next = unsafe { (*node).next };
            // (HAZ:3) this `Acquire` CAS synchronizes-with the `Release` CAS in (HAZ:1)
            match self.head.compare_exchange(node, next, Acquire, Relaxed) {
                Ok(_) => break node,
                Err(actual) => head = actual,
            }
        };

        slot.clear();

        // the node has been unlinked by this thread, so no other thread will
        // ever touch its element again, concurrent readers may still access
        // its `next` field
        unsafe {
            let elem = ManuallyDrop::into_inner(ptr::read(&(*node).elem));
            // the node's destructor never accesses `T`, so it is fine to erase
            // any non-static lifetimes
            R::retire(Retired::new_unchecked(NonNull::new_unchecked(node)));
            R::try_reclaim();

            Ok(Some(elem))
        }
    }

    #[inline]
    fn node(&self, elem: Box<T>) -> Node<T> {
        #[cfg(test)]
        {
            Node::new(elem, Arc::clone(&self.stats))
        }
        #[cfg(not(test))]
        {
            Node::new(elem)
        }
    }

    #[cfg(test)]
    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }
}

/********** impl ConcurrentStack ******************************************************************/

impl<T: Send, R: Reclaim> ConcurrentStack<T> for HazardStack<T, R> {
    #[inline]
    fn push_boxed(&self, elem: Box<T>) {
        HazardStack::push_boxed(self, elem);
    }

    #[inline]
    fn pop_boxed(&self) -> Option<Box<T>> {
        HazardStack::pop_boxed(self)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        HazardStack::is_empty(self)
    }
}

/********** impl Default **************************************************************************/

impl<T, R: Reclaim> Default for HazardStack<T, R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T, R: Reclaim> fmt::Debug for HazardStack<T, R> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardStack").field("head", &self.head.load(Relaxed)).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T, R: Reclaim> Drop for HazardStack<T, R> {
    #[inline]
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            let mut node = unsafe { Box::from_raw(curr) };
            unsafe { ManuallyDrop::drop(&mut node.elem) };
            curr = node.next;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: ManuallyDrop<Box<T>>,
    next: *mut Node<T>,
    #[cfg(test)]
    stats: Arc<NodeStats>,
}

impl<T> Node<T> {
    #[cfg(not(test))]
    #[inline]
    fn new(elem: Box<T>) -> Self {
        Self { elem: ManuallyDrop::new(elem), next: ptr::null_mut() }
    }

    #[cfg(test)]
    fn new(elem: Box<T>, stats: Arc<NodeStats>) -> Self {
        stats.allocated.fetch_add(1, Relaxed);
        Self { elem: ManuallyDrop::new(elem), next: ptr::null_mut(), stats }
    }
}

#[cfg(test)]
impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        self.stats.freed.fetch_add(1, Relaxed);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NodeStats
////////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
#[derive(Debug, Default)]
struct NodeStats {
    allocated: core::sync::atomic::AtomicUsize,
    freed: core::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl NodeStats {
    fn allocated(&self) -> usize {
        self.allocated.load(Relaxed)
    }

    fn freed(&self) -> usize {
        self.freed.load(Relaxed)
    }
}
