use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use Ordering::{Acquire, Relaxed, Release};

use crate::hazard;
use crate::reclaim::Deferred;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Chain
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A plain singly linked list of deferred entries with a length counter.
///
/// Chains have a single owner and are used both as the thread-local reclaim
/// list and for moving batches of entries in and out of an [`AtomicList`].
/// A chain does not free its entries when dropped, they must be moved on or
/// scanned explicitly.
#[derive(Debug)]
pub(crate) struct Chain {
    head: *mut Deferred,
    tail: *mut Deferred,
    len: usize,
}

// a chain exclusively owns its entries
unsafe impl Send for Chain {}

/********** impl inherent *************************************************************************/

impl Chain {
    /// Creates a new empty chain.
    #[inline]
    pub const fn new() -> Self {
        Self { head: ptr::null_mut(), tail: ptr::null_mut(), len: 0 }
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the chain contains no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Moves all entries out of `self`, leaving it empty.
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::replace(self, Self::new())
    }

    /// Prepends a single (unlinked) entry.
    #[inline]
    pub fn push(&mut self, entry: NonNull<Deferred>) {
        let entry = entry.as_ptr();
        unsafe { (*entry).next = self.head };
        if self.tail.is_null() {
            self.tail = entry;
        }

        self.head = entry;
        self.len += 1;
    }

    /// Prepends all entries of `other`.
    #[inline]
    pub fn append(&mut self, mut other: Self) {
        if other.is_empty() {
            return;
        }

        let other = other.take();
        unsafe { (*other.tail).next = self.head };
        if self.tail.is_null() {
            self.tail = other.tail;
        }

        self.head = other.head;
        self.len += other.len;
    }

    /// Scans every entry against the hazard registry, frees all records for
    /// which no hazard is published and keeps the remaining ones.
    ///
    /// Returns the number of freed records.
    #[inline]
    pub fn reclaim_unprotected(&mut self) -> usize {
        let mut curr = self.take().head;
        let mut freed = 0;

        while let Some(entry) = NonNull::new(curr) {
            curr = unsafe { (*entry.as_ptr()).next };
            if hazard::anyone_holds(unsafe { Deferred::address(entry) }) {
                self.push(entry);
            } else {
                unsafe { Deferred::reclaim(entry) };
                freed += 1;
            }
        }

        freed
    }

    /// Builds a chain from the head of a null-terminated list by walking it to
    /// its end.
    ///
    /// # Safety
    ///
    /// All entries reachable from `head` must be exclusively owned by the
    /// caller.
    #[inline]
    unsafe fn from_head(head: *mut Deferred) -> Self {
        let mut chain = Self { head, tail: head, len: 0 };
        let mut curr = head;
        while !curr.is_null() {
            chain.tail = curr;
            chain.len += 1;
            curr = (*curr).next;
        }

        chain
    }
}

/********** impl Default **************************************************************************/

impl Default for Chain {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A shared singly linked list of deferred entries.
///
/// Entries are linked in with CAS just like nodes of a Treiber stack and the
/// list is only ever drained as a whole by exchanging its head with `null`.
#[derive(Debug)]
pub(crate) struct AtomicList {
    head: AtomicPtr<Deferred>,
}

/********** impl inherent *************************************************************************/

impl AtomicList {
    /// Creates a new empty list.
    #[inline]
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Returns `true` if the list is currently empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }

    /// Links a single (unlinked) entry into the list.
    #[inline]
    pub fn push(&self, entry: NonNull<Deferred>) {
        let mut chain = Chain::new();
        chain.push(entry);
        self.push_chain(chain);
    }

    /// Links all entries of `chain` into the list with a single successful
    /// CAS.
    #[inline]
    pub fn push_chain(&self, mut chain: Chain) {
        if chain.is_empty() {
            return;
        }

        let Chain { head, tail, .. } = chain.take();
        let mut curr = self.head.load(Relaxed);
        loop {
            unsafe { (*tail).next = curr };
            // (LST:1) this `Release` CAS synchronizes-with the `Acquire` swap in (LST:2)
            match self.head.compare_exchange_weak(curr, head, Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => curr = actual,
            }
        }
    }

    /// Takes all entries out of the list, leaving it empty.
    #[inline]
    pub fn take(&self) -> Chain {
        // (LST:2) this `Acquire` swap synchronizes-with the `Release` CAS in (LST:1)
        let head = self.head.swap(ptr::null_mut(), Acquire);
        unsafe { Chain::from_head(head) }
    }

    /// Drains the list, frees every record that is no longer hazardous and
    /// links the remaining entries back in.
    ///
    /// Returns the number of freed and re-inserted entries.
    #[inline]
    pub fn reclaim_unprotected(&self) -> (usize, usize) {
        let mut chain = self.take();
        if chain.is_empty() {
            return (0, 0);
        }

        let freed = chain.reclaim_unprotected();
        let remaining = chain.len();
        self.push_chain(chain);

        (freed, remaining)
    }
}

/********** impl Default **************************************************************************/

impl Default for AtomicList {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::{AtomicList, Chain};
    use crate::hazard;
    use crate::reclaim::tests::retired;
    use crate::reclaim::Deferred;

    fn entry(count: &Arc<AtomicUsize>) -> std::ptr::NonNull<Deferred> {
        Deferred::try_new(retired(count)).unwrap_or_else(|_| panic!("allocation failed"))
    }

    #[test]
    fn chain_push_append() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut a = Chain::new();
        let mut b = Chain::new();

        a.push(entry(&count));
        a.push(entry(&count));
        b.push(entry(&count));
        assert_eq!(2, a.len());

        a.append(b);
        assert_eq!(3, a.len());
        a.append(Chain::new());
        assert_eq!(3, a.len());

        assert_eq!(3, a.reclaim_unprotected());
        assert!(a.is_empty());
        assert_eq!(3, count.load(Ordering::Relaxed));
    }

    #[test]
    fn chain_keeps_hazardous() {
        thread::spawn(|| {
            let count = Arc::new(AtomicUsize::new(0));
            let protected = entry(&count);
            let mut chain = Chain::new();
            chain.push(entry(&count));
            chain.push(protected);
            chain.push(entry(&count));

            let slot = hazard::acquire().unwrap();
            slot.protect(unsafe { Deferred::address(protected) });

            assert_eq!(2, chain.reclaim_unprotected());
            assert_eq!(1, chain.len());
            assert_eq!(2, count.load(Ordering::Relaxed));

            slot.clear();
            assert_eq!(1, chain.reclaim_unprotected());
            assert!(chain.is_empty());
            assert_eq!(3, count.load(Ordering::Relaxed));
            hazard::release();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn atomic_list() {
        let count = Arc::new(AtomicUsize::new(0));
        let list = AtomicList::new();
        assert!(list.is_empty());

        list.push(entry(&count));
        let mut chain = Chain::new();
        chain.push(entry(&count));
        chain.push(entry(&count));
        list.push_chain(chain);
        list.push_chain(Chain::new());

        let mut taken = list.take();
        assert!(list.is_empty());
        assert_eq!(3, taken.len());
        assert_eq!(3, taken.reclaim_unprotected());
        assert_eq!(3, count.load(Ordering::Relaxed));
    }

    #[test]
    fn atomic_list_reclaim() {
        let count = Arc::new(AtomicUsize::new(0));
        let list = AtomicList::new();
        assert_eq!((0, 0), list.reclaim_unprotected());

        for _ in 0..4 {
            list.push(entry(&count));
        }

        assert_eq!((4, 0), list.reclaim_unprotected());
        assert!(list.is_empty());
        assert_eq!(4, count.load(Ordering::Relaxed));
    }

    #[test]
    fn concurrent_push() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1_000;

        let count = Arc::new(AtomicUsize::new(0));
        let list = Arc::new(AtomicList::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = Arc::clone(&count);
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        list.push(entry(&count));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut chain = list.take();
        assert_eq!(THREADS * PER_THREAD, chain.len());
        chain.reclaim_unprotected();
        assert_eq!(THREADS * PER_THREAD, count.load(Ordering::Relaxed));
    }
}
