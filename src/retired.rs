use core::cmp;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type-erased fat pointer to an unlinked, heap allocated record.
///
/// The vtable of the fat pointer carries the record's concrete destructor, so
/// a [`Retired`] can be dropped and de-allocated long after the type it was
/// created from is out of scope.
pub struct Retired(NonNull<dyn Any + 'static>);

/********** impl inherent *************************************************************************/

impl Retired {
    /// Creates a new [`Retired`] record from a pointer to a value that was
    /// allocated through a [`Box`].
    ///
    /// # Safety
    ///
    /// - `record` **must** have been created by [`Box::into_raw`] (or
    ///   equivalent) and must not be owned by anything else afterwards
    /// - *if* `T` implements [`Drop`] *and* contains any non-static
    ///   references, it must be ensured that these are **not** accessed by its
    ///   [`drop`][Drop::drop] function
    #[inline]
    pub unsafe fn new_unchecked<'a, T: 'a>(record: NonNull<T>) -> Self {
        let any: NonNull<dyn Any + 'a> = record;
        let any: NonNull<dyn Any + 'static> = mem::transmute(any);

        Self(any)
    }

    /// Returns the address of the retired record, stripped of its vtable.
    #[inline]
    pub fn as_ptr(&self) -> *const () {
        self.0.as_ptr() as *mut () as *const ()
    }

    /// Returns the numeric representation of the retired record's memory
    /// address.
    #[inline]
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Reclaims the retired record by dropping it and de-allocating its memory.
    ///
    /// # Safety
    ///
    /// No other thread or scope may still hold any reference to the record.
    #[inline]
    pub unsafe fn reclaim(self) {
        mem::drop(Box::from_raw(self.0.as_ptr()));
    }
}

// the record is exclusively owned and only ever dropped, never accessed
unsafe impl Send for Retired {}

/********** impl PartialEq ************************************************************************/

impl PartialEq for Retired {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr().eq(&other.as_ptr())
    }
}

impl Eq for Retired {}

/********** impl PartialOrd ***********************************************************************/

impl PartialOrd for Retired {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Retired {
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.as_ptr().cmp(&other.as_ptr())
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Retired {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Retired").field("address", &self.as_ptr()).finish()
    }
}

/********** impl Display **************************************************************************/

impl fmt::Display for Retired {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Any (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

trait Any {}
impl<T> Any for T {}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::Retired;

    struct DropCount(Arc<AtomicUsize>);

    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retire<T>(value: T) -> Retired {
        let raw = Box::into_raw(Box::new(value));
        unsafe { Retired::new_unchecked(NonNull::new_unchecked(raw)) }
    }

    #[test]
    fn address() {
        let raw = Box::into_raw(Box::new(1u64));
        let retired = unsafe { Retired::new_unchecked(NonNull::new_unchecked(raw)) };
        assert_eq!(raw as usize, retired.address());
        assert_eq!(raw as *const (), retired.as_ptr());
        unsafe { retired.reclaim() };
    }

    #[test]
    fn reclaim_runs_erased_destructor() {
        let count = Arc::new(AtomicUsize::new(0));
        let first = retire(DropCount(Arc::clone(&count)));
        let second = retire(vec![DropCount(Arc::clone(&count)), DropCount(Arc::clone(&count))]);

        assert_eq!(0, count.load(Ordering::Relaxed));
        unsafe { first.reclaim() };
        assert_eq!(1, count.load(Ordering::Relaxed));
        unsafe { second.reclaim() };
        assert_eq!(3, count.load(Ordering::Relaxed));
    }

    #[test]
    fn cmp() {
        let a = retire(1u32);
        let b = retire(2u32);
        assert_ne!(a, b);
        assert_eq!(a.address() < b.address(), a < b);
        unsafe {
            a.reclaim();
            b.reclaim();
        }
    }
}
