//! Treiber's stack, made memory safe through split reference counting.
//!
//! Every reference to a node that is stored in the stack's head carries an
//! *external* counter, incremented by each thread that is about to access the
//! node.
//! Every node carries an *internal* counter.
//! When a node is unlinked, the winning thread donates the external count
//! (minus its own reference and the one held by the head itself) to the
//! internal counter, while every losing thread that had already incremented
//! the external counter decrements the internal one.
//! The node is freed by whichever thread brings the internal counter to
//! zero.
//!
//! Since a reference has to fit into a single atomic word alongside its
//! counter, nodes are not addressed by pointer but by an index into a
//! [`Slab`], which never releases its memory while the stack is alive.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{self, AtomicI64, Ordering};

use typenum::U32;

use Ordering::{Acquire, Relaxed, Release};

use crate::align::CachePadded;
use crate::ConcurrentStack;

mod packed;
mod slab;

pub use self::packed::{AtomicCountedRef, CountedRef, CounterWidth};

use self::slab::Slab;

////////////////////////////////////////////////////////////////////////////////////////////////////
// CountedStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack whose nodes are reclaimed through split reference
/// counting.
///
/// `N` is the type-level number of bits used for the external counter, the
/// remaining `64 - N` bits of the head word index the node slab.
/// Unlike [`HazardStack`](crate::HazardStack), this stack needs no thread
/// registration and popped nodes are never deferred: each node is returned
/// to the slab exactly when its last reference is given up.
pub struct CountedStack<T, N: CounterWidth = U32> {
    head: CachePadded<AtomicCountedRef<N>>,
    slab: Slab<Node<T, N>>,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send, N: CounterWidth> Send for CountedStack<T, N> {}
unsafe impl<T: Send, N: CounterWidth> Sync for CountedStack<T, N> {}

/********** impl inherent *************************************************************************/

impl<T, N: CounterWidth> CountedStack<T, N> {
    /// Creates a new empty stack.
    #[inline]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicCountedRef::null()),
            slab: Slab::new(CountedRef::<N>::NULL_INDEX),
        }
    }

    /// Returns `true` if the 64-bit compound head is updated by native atomic
    /// instructions.
    ///
    /// The stack is only available on targets with 64-bit atomics, so this
    /// is always the case where it can be called at all.
    #[inline]
    pub const fn is_lock_free() -> bool {
        cfg!(target_has_atomic = "64")
    }

    /// Returns `true` if the stack was empty at the time of the check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }

    /// Returns the number of nodes that have not yet been freed.
    ///
    /// This includes nodes of elements that have already been popped but are
    /// still referenced by concurrent pops.
    #[inline]
    pub fn live_nodes(&self) -> usize {
        self.slab.live()
    }

    /// Pushes `elem` on top of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack holds `2^(64 - N) - 1` nodes already.
    #[inline]
    pub fn push(&self, elem: T) {
        self.push_boxed(Box::new(elem));
    }

    /// Pushes the already heap allocated `elem` on top of the stack without
    /// moving it out of its allocation.
    ///
    /// # Panics
    ///
    /// Panics if the stack holds `2^(64 - N) - 1` nodes already.
    #[inline]
    pub fn push_boxed(&self, elem: Box<T>) {
        let index = self.slab.insert(Node::new(elem));
        let node = unsafe { self.slab.get(index) };
        let new = CountedRef::new(index, 1);

        let mut head = self.head.load(Relaxed);
        loop {
            node.next.store(head, Relaxed);
            // (CNT:1) this `Release` CAS synchronizes-with the `Acquire` CAS in (CNT:2)
            match self.head.compare_exchange_weak(head, new, Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the topmost element from the stack.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.pop_boxed().map(|elem| *elem)
    }

    /// Pops the topmost element from the stack in the allocation it was
    /// pushed in.
    pub fn pop_boxed(&self) -> Option<Box<T>> {
        let mut head = self.head.load(Relaxed);
        loop {
            let (held, index) = self.acquire_head(head)?;
            let node = unsafe { self.slab.get(index) };
            let next = node.next.load(Relaxed);

            match self.head.compare_exchange(held, next, Relaxed, Relaxed) {
                Ok(_) => {
                    // the node is unlinked and only this thread may take its
                    // element, other holders only ever read `next`
                    let elem = unsafe { ManuallyDrop::into_inner(ptr::read(&node.elem)) };

                    // one reference is held by this thread, one was held by
                    // the head itself
                    let donated = held.count() as i64 - 2;
                    // (CNT:3) this `Release` RMW synchronizes-with the `Acquire` fence in (CNT:4)
                    if node.internal.fetch_add(donated, Release) == -donated {
                        // (CNT:4) this `Acquire` fence synchronizes-with the `Release` RMWs in
                        // (CNT:3) and (CNT:5)
                        atomic::fence(Acquire);
                        unsafe { self.free(index) };
                    }

                    return Some(elem);
                }
                Err(actual) => {
                    // (CNT:5) this `Release` RMW synchronizes-with the `Acquire` fence in (CNT:4)
                    if node.internal.fetch_sub(1, Release) == 1 {
                        atomic::fence(Acquire);
                        unsafe { self.free(index) };
                    }

                    head = actual;
                }
            }
        }
    }

    /// Increments the external counter of the current head, so the node it
    /// references can be accessed safely.
    ///
    /// Returns the incremented head and its slab index or `None` if the stack
    /// is empty, an empty head is never incremented.
    #[inline]
    fn acquire_head(&self, mut head: CountedRef<N>) -> Option<(CountedRef<N>, u32)> {
        loop {
            let index = head.index()?;
            let held = head.increment();
            // (CNT:2) this `Acquire` CAS synchronizes-with the `Release` CAS in (CNT:1)
            match self.head.compare_exchange_weak(head, held, Acquire, Relaxed) {
                Ok(_) => return Some((held, index)),
                Err(actual) => head = actual,
            }
        }
    }

    /// Returns the node at `index` to the slab.
    ///
    /// # Safety
    ///
    /// The node must be unlinked, its element must have been taken and no
    /// thread may hold a reference to it anymore.
    #[inline]
    unsafe fn free(&self, index: u32) {
        drop(self.slab.remove(index));
    }
}

/********** impl ConcurrentStack ******************************************************************/

impl<T: Send, N: CounterWidth> ConcurrentStack<T> for CountedStack<T, N> {
    #[inline]
    fn push_boxed(&self, elem: Box<T>) {
        CountedStack::push_boxed(self, elem);
    }

    #[inline]
    fn pop_boxed(&self) -> Option<Box<T>> {
        CountedStack::pop_boxed(self)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        CountedStack::is_empty(self)
    }
}

/********** impl Default **************************************************************************/

impl<T, N: CounterWidth> Default for CountedStack<T, N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T, N: CounterWidth> fmt::Debug for CountedStack<T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CountedStack")
            .field("head", &self.head.load(Relaxed))
            .field("live_nodes", &self.live_nodes())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T, N: CounterWidth> Drop for CountedStack<T, N> {
    #[inline]
    fn drop(&mut self) {
        let mut curr = self.head.load(Relaxed);
        while let Some(index) = curr.index() {
            let mut node = unsafe { self.slab.remove(index) };
            curr = node.next.load(Relaxed);
            unsafe { ManuallyDrop::drop(&mut node.elem) };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T, N> {
    elem: ManuallyDrop<Box<T>>,
    internal: AtomicI64,
    next: AtomicCountedRef<N>,
}

impl<T, N: CounterWidth> Node<T, N> {
    #[inline]
    fn new(elem: Box<T>) -> Self {
        Self { elem: ManuallyDrop::new(elem), internal: AtomicI64::new(0), next: AtomicCountedRef::null() }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use typenum::{U40, U48};

    use super::CountedStack;
    use crate::reclaim::tests::DropCount;
    use crate::ConcurrentStack;

    #[test]
    fn lock_free() {
        assert!(CountedStack::<i32>::is_lock_free());
    }

    #[test]
    fn lifo() {
        let stack: CountedStack<i32> = CountedStack::new();
        stack.push(50);
        stack.push(89);
        assert_eq!(Some(89), stack.pop());
        assert_eq!(Some(50), stack.pop());
        assert_eq!(None, stack.pop());
        assert_eq!(0, stack.live_nodes());
    }

    #[test]
    fn lifo_wide_counter() {
        let stack: CountedStack<i32, U48> = CountedStack::new();
        for i in 0..100 {
            stack.push(i);
        }

        for i in (0..100).rev() {
            assert_eq!(Some(i), stack.pop());
        }

        assert_eq!(None, stack.pop());
    }

    #[test]
    fn pop_empty() {
        let stack: CountedStack<i32> = CountedStack::new();
        for _ in 0..10 {
            assert_eq!(None, stack.pop());
        }

        // the counter of an empty head is left untouched
        assert!(stack.head.load(Ordering::Relaxed).is_null());
        assert_eq!(0, stack.head.load(Ordering::Relaxed).count());
        assert!(stack.is_empty());
    }

    #[test]
    fn boxed() {
        let stack: CountedStack<[u8; 64]> = CountedStack::new();
        let elem = Box::new([3; 64]);
        let addr = &*elem as *const [u8; 64];

        stack.push_boxed(elem);
        let popped = stack.pop_boxed().unwrap();
        assert_eq!(addr, &*popped as *const [u8; 64]);
    }

    #[test]
    fn slots_are_reused() {
        let stack: CountedStack<i32> = CountedStack::new();
        stack.push(1);
        let first = stack.head.load(Ordering::Relaxed).index();
        assert_eq!(Some(1), stack.pop());

        stack.push(2);
        assert_eq!(first, stack.head.load(Ordering::Relaxed).index());
        assert_eq!(1, stack.live_nodes());
    }

    #[test]
    fn drop_remaining() {
        let count = Arc::new(AtomicUsize::new(0));
        let stack: CountedStack<DropCount, U40> = CountedStack::new();
        for _ in 0..10 {
            stack.push(DropCount(Arc::clone(&count)));
        }

        drop(stack.pop());
        assert_eq!(1, count.load(Ordering::Relaxed));

        drop(stack);
        assert_eq!(10, count.load(Ordering::Relaxed));
    }

    #[test]
    fn no_loss_no_duplicates() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 10_000;

        let stack: Arc<CountedStack<usize>> = Arc::new(CountedStack::new());
        let barrier = Arc::new(Barrier::new(2 * THREADS));

        let producers: Vec<_> = (0..THREADS)
            .map(|id| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        stack.push(id * PER_THREAD + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..THREADS)
            .map(|_| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = Vec::with_capacity(PER_THREAD);
                    while popped.len() < PER_THREAD {
                        if let Some(elem) = stack.pop() {
                            popped.push(elem);
                        }
                    }

                    popped
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = HashSet::new();
        for consumer in consumers {
            for elem in consumer.join().unwrap() {
                assert!(seen.insert(elem), "{} was popped twice", elem);
            }
        }

        assert_eq!(THREADS * PER_THREAD, seen.len());
        // every node is freed by the last pop referencing it, nothing is deferred
        assert_eq!(0, stack.live_nodes());
    }

    #[test]
    fn trait_object() {
        let stack: Box<dyn ConcurrentStack<String>> = Box::new(CountedStack::<String>::new());
        stack.push("a".to_string());
        assert_eq!(Some("a".to_string()), stack.pop());
        assert!(stack.is_empty());
    }
}
