use core::cmp;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use typenum::{IsGreaterOrEqual, IsLess, True, Unsigned, U32, U64};

////////////////////////////////////////////////////////////////////////////////////////////////////
// CounterWidth (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The type-level number of bits reserved for the external counter of a
/// [`CountedRef`].
///
/// The counter takes the upper `N` bits of the 64-bit word, the remaining
/// `64 - N` lower bits store a slab index.
/// At least 32 counter bits are required, so that the counter can not
/// realistically overflow even when thousands of threads contend for the
/// same node.
pub trait CounterWidth: Unsigned {}

impl<N> CounterWidth for N where
    N: Unsigned + IsGreaterOrEqual<U32, Output = True> + IsLess<U64, Output = True>
{
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// CountedRef
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A reference to a slab allocated node that carries an external reference
/// counter in its upper `N` bits.
///
/// The all-ones index marks a `null` reference.
pub struct CountedRef<N> {
    inner: u64,
    _marker: PhantomData<N>,
}

/********** impl Clone ****************************************************************************/

impl<N> Clone for CountedRef<N> {
    #[inline]
    fn clone(&self) -> Self {
        Self { inner: self.inner, _marker: PhantomData }
    }
}

/********** impl Copy *****************************************************************************/

impl<N> Copy for CountedRef<N> {}

/********** impl inherent *************************************************************************/

impl<N: CounterWidth> CountedRef<N> {
    /// The number of bits of the external counter.
    pub const COUNT_BITS: u32 = N::U32;
    /// The number of bits of the slab index.
    pub const INDEX_BITS: u32 = 64 - Self::COUNT_BITS;
    /// The bitmask for the (lower) index bits.
    pub const INDEX_MASK: u64 = index_mask(Self::INDEX_BITS);
    /// The index value representing `null`.
    pub const NULL_INDEX: u32 = Self::INDEX_MASK as u32;
    /// The largest representable counter value.
    pub const MAX_COUNT: u64 = u64::MAX >> Self::INDEX_BITS;

    /// Creates a new `null` reference with a zero counter.
    #[inline]
    pub fn null() -> Self {
        Self::from_raw(Self::INDEX_MASK)
    }

    /// Composes a new reference from a slab `index` and an external `count`.
    ///
    /// Bits of either argument that exceed their respective width are
    /// truncated.
    #[inline]
    pub fn new(index: u32, count: u64) -> Self {
        debug_assert!(u64::from(index) <= Self::INDEX_MASK);
        debug_assert!(count <= Self::MAX_COUNT);
        Self::from_raw(compose(index, count, Self::INDEX_BITS))
    }

    /// Creates a reference from its integer representation.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self { inner: raw, _marker: PhantomData }
    }

    /// Returns the integer representation of the reference.
    #[inline]
    pub fn into_raw(self) -> u64 {
        self.inner
    }

    /// Returns `true` if the reference is `null`.
    #[inline]
    pub fn is_null(self) -> bool {
        self.inner & Self::INDEX_MASK == Self::INDEX_MASK
    }

    /// Returns the slab index or `None` if the reference is `null`.
    #[inline]
    pub fn index(self) -> Option<u32> {
        match decompose_index(self.inner, Self::INDEX_BITS) {
            index if index == Self::NULL_INDEX => None,
            index => Some(index),
        }
    }

    /// Returns the external counter.
    #[inline]
    pub fn count(self) -> u64 {
        decompose_count(self.inner, Self::INDEX_BITS)
    }

    /// Returns the same reference with its external counter raised by one.
    #[inline]
    pub fn increment(self) -> Self {
        debug_assert!(self.count() < Self::MAX_COUNT, "external counter overflow");
        Self::from_raw(self.inner + (1 << Self::INDEX_BITS))
    }
}

/********** impl Default **************************************************************************/

impl<N: CounterWidth> Default for CountedRef<N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/********** impl Debug ****************************************************************************/

impl<N: CounterWidth> fmt::Debug for CountedRef<N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CountedRef")
            .field("index", &self.index())
            .field("count", &self.count())
            .finish()
    }
}

/********** impl PartialEq ************************************************************************/

impl<N> PartialEq for CountedRef<N> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<N> Eq for CountedRef<N> {}

/********** impl PartialOrd ***********************************************************************/

impl<N> PartialOrd for CountedRef<N> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<N> Ord for CountedRef<N> {
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.inner.cmp(&other.inner)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicCountedRef
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [`CountedRef`] which can be shared between threads.
///
/// Index and counter are always loaded, stored and exchanged as one unit.
pub struct AtomicCountedRef<N> {
    inner: AtomicU64,
    _marker: PhantomData<N>,
}

/********** impl inherent *************************************************************************/

impl<N: CounterWidth> AtomicCountedRef<N> {
    /// Creates a new `AtomicCountedRef`.
    #[inline]
    pub fn new(counted: CountedRef<N>) -> Self {
        Self { inner: AtomicU64::new(counted.inner), _marker: PhantomData }
    }

    /// Creates a new `null` reference.
    #[inline]
    pub fn null() -> Self {
        Self::new(CountedRef::null())
    }

    /// Consumes `self` and returns the inner [`CountedRef`].
    #[inline]
    pub fn into_inner(self) -> CountedRef<N> {
        CountedRef::from_raw(self.inner.into_inner())
    }

    /// Loads the current value.
    #[inline]
    pub fn load(&self, order: Ordering) -> CountedRef<N> {
        CountedRef::from_raw(self.inner.load(order))
    }

    /// Stores `counted`.
    #[inline]
    pub fn store(&self, counted: CountedRef<N>, order: Ordering) {
        self.inner.store(counted.inner, order);
    }

    /// Stores `counted` and returns the previous value.
    #[inline]
    pub fn swap(&self, counted: CountedRef<N>, order: Ordering) -> CountedRef<N> {
        CountedRef::from_raw(self.inner.swap(counted.inner, order))
    }

    /// Stores `new` if the current value is equal to `current` in both index
    /// and counter.
    ///
    /// # Errors
    ///
    /// Returns the actual value if it differs from `current`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: CountedRef<N>,
        new: CountedRef<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedRef<N>, CountedRef<N>> {
        self.inner
            .compare_exchange(current.inner, new.inner, success, failure)
            .map(CountedRef::from_raw)
            .map_err(CountedRef::from_raw)
    }

    /// Stores `new` if the current value is equal to `current` in both index
    /// and counter.
    ///
    /// Unlike [`compare_exchange`][AtomicCountedRef::compare_exchange], this
    /// function is allowed to fail spuriously.
    ///
    /// # Errors
    ///
    /// Returns the actual value if it differs from `current` or the
    /// exchange failed spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: CountedRef<N>,
        new: CountedRef<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedRef<N>, CountedRef<N>> {
        self.inner
            .compare_exchange_weak(current.inner, new.inner, success, failure)
            .map(CountedRef::from_raw)
            .map_err(CountedRef::from_raw)
    }
}

/********** impl Default **************************************************************************/

impl<N: CounterWidth> Default for AtomicCountedRef<N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/********** impl Debug ****************************************************************************/

impl<N: CounterWidth> fmt::Debug for AtomicCountedRef<N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::SeqCst), f)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// helper functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Gets the bitmask for the lower `index_bits`.
#[inline]
const fn index_mask(index_bits: u32) -> u64 {
    (1 << index_bits) - 1
}

/// Composes the integer representation of a counted reference.
#[inline]
const fn compose(index: u32, count: u64, index_bits: u32) -> u64 {
    (count << index_bits) | (index as u64 & index_mask(index_bits))
}

/// Decomposes the integer representation of a counted reference into *only*
/// its index.
#[inline]
const fn decompose_index(counted: u64, index_bits: u32) -> u32 {
    (counted & index_mask(index_bits)) as u32
}

/// Decomposes the integer representation of a counted reference into *only*
/// its counter.
#[inline]
const fn decompose_count(counted: u64, index_bits: u32) -> u64 {
    counted >> index_bits
}
