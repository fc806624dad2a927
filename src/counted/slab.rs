use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use Ordering::{AcqRel, Acquire, Relaxed, Release};

/// The number of buckets, bucket `i` holds `2^i` slots.
const BUCKETS: usize = 32;
/// The end marker of the free list.
const NIL: u32 = u32::MAX;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Slab
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent slab handing out stable `u32` indices for its values.
///
/// Slots are allocated in buckets of doubling size, which are never moved or
/// freed before the slab itself is dropped, so a slot may be accessed by
/// index at any time.
/// Vacated slots are kept in a lock-free free list, whose head is tagged with
/// a modification counter to rule out ABA.
///
/// The slab does not track which slots are occupied: values that are still
/// present when the slab is dropped are leaked.
pub(crate) struct Slab<T> {
    buckets: [AtomicPtr<Slot<T>>; BUCKETS],
    /// lower 32 bits: index of the first free slot, upper 32 bits: tag
    free: AtomicU64,
    /// the lowest index that has never been handed out
    unused: AtomicU64,
    /// (exclusive) upper bound for indices
    limit: u32,
    live: AtomicUsize,
}

unsafe impl<T: Send> Send for Slab<T> {}
unsafe impl<T: Send> Sync for Slab<T> {}

/********** impl inherent *************************************************************************/

impl<T> Slab<T> {
    /// Creates a new empty slab that hands out indices below `limit`.
    #[inline]
    pub const fn new(limit: u32) -> Self {
        Self {
            buckets: [const { AtomicPtr::new(ptr::null_mut()) }; BUCKETS],
            free: AtomicU64::new(NIL as u64),
            unused: AtomicU64::new(0),
            limit,
            live: AtomicUsize::new(0),
        }
    }

    /// Returns the number of values currently stored in the slab.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Relaxed)
    }

    /// Moves `value` into a vacant slot and returns its index.
    ///
    /// # Panics
    ///
    /// Panics if all indices below the slab's limit are occupied.
    #[inline]
    pub fn insert(&self, value: T) -> u32 {
        let index = match self.pop_free() {
            Some(index) => index,
            None => {
                let index = self.unused.fetch_add(1, Relaxed);
                assert!(index < u64::from(self.limit), "slab exhausted: {} slots in use", self.limit);
                index as u32
            }
        };

        let slot = self.slot_or_alloc(index);
        unsafe { (*slot.value.get()).write(value) };
        self.live.fetch_add(1, Relaxed);

        index
    }

    /// Returns a reference to the value at `index`.
    ///
    /// # Safety
    ///
    /// The slot at `index` must be occupied and must not be vacated for the
    /// lifetime of the returned reference.
    #[inline]
    pub unsafe fn get(&self, index: u32) -> &T {
        (*self.slot(index).value.get()).assume_init_ref()
    }

    /// Moves the value at `index` out of the slab and vacates its slot.
    ///
    /// # Safety
    ///
    /// The slot at `index` must be occupied and no references to its value
    /// may exist anymore.
    #[inline]
    pub unsafe fn remove(&self, index: u32) -> T {
        let value = (*self.slot(index).value.get()).assume_init_read();
        self.live.fetch_sub(1, Relaxed);
        self.push_free(index);

        value
    }

    /// Returns the (already allocated) slot at `index`.
    #[inline]
    fn slot(&self, index: u32) -> &Slot<T> {
        let (bucket, offset) = locate(index);
        let slots = self.buckets[bucket].load(Acquire);
        debug_assert!(!slots.is_null(), "access to unallocated slab bucket");
        unsafe { &*slots.add(offset) }
    }

    #[inline]
    fn slot_or_alloc(&self, index: u32) -> &Slot<T> {
        let (bucket, offset) = locate(index);
        let mut slots = self.buckets[bucket].load(Acquire);
        if slots.is_null() {
            slots = self.alloc_bucket(bucket);
        }

        unsafe { &*slots.add(offset) }
    }

    #[cold]
    fn alloc_bucket(&self, bucket: usize) -> *mut Slot<T> {
        let slots: Box<[Slot<T>]> = (0..bucket_len(bucket)).map(|_| Slot::new()).collect();
        let slots = Box::into_raw(slots) as *mut Slot<T>;

        match self.buckets[bucket].compare_exchange(ptr::null_mut(), slots, AcqRel, Acquire) {
            Ok(_) => slots,
            Err(winner) => {
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(slots, bucket_len(bucket)))) };
                winner
            }
        }
    }

    #[inline]
    fn pop_free(&self) -> Option<u32> {
        let mut curr = self.free.load(Acquire);
        loop {
            let (index, tag) = unpack(curr);
            if index == NIL {
                return None;
            }

            // a stale `next_free` is rejected by the tag
            let next = self.slot(index).next_free.load(Relaxed);
            match self.free.compare_exchange_weak(curr, pack(next, tag.wrapping_add(1)), Acquire, Acquire)
            {
                Ok(_) => return Some(index),
                Err(actual) => curr = actual,
            }
        }
    }

    #[inline]
    fn push_free(&self, index: u32) {
        let slot = self.slot(index);
        let mut curr = self.free.load(Relaxed);
        loop {
            let (next, tag) = unpack(curr);
            slot.next_free.store(next, Relaxed);
            match self.free.compare_exchange_weak(curr, pack(index, tag.wrapping_add(1)), Release, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => curr = actual,
            }
        }
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for Slab<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Slab").field("live", &self.live()).field("limit", &self.limit).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Slab<T> {
    #[inline]
    fn drop(&mut self) {
        for (bucket, slots) in self.buckets.iter_mut().enumerate() {
            let slots = *slots.get_mut();
            if !slots.is_null() {
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(slots, bucket_len(bucket)))) };
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Slot
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    next_free: AtomicU32,
}

impl<T> Slot<T> {
    #[inline]
    fn new() -> Self {
        Self { value: UnsafeCell::new(MaybeUninit::uninit()), next_free: AtomicU32::new(NIL) }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// helper functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Returns the bucket and the offset within the bucket for `index`.
#[inline]
const fn locate(index: u32) -> (usize, usize) {
    let id = index + 1;
    let bucket = 31 - id.leading_zeros();
    (bucket as usize, (id - (1 << bucket)) as usize)
}

#[inline]
const fn bucket_len(bucket: usize) -> usize {
    1 << bucket
}

#[inline]
const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
const fn unpack(free: u64) -> (u32, u32) {
    (free as u32, (free >> 32) as u32)
}
