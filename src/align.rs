//! Thin wrapper types for artificially raising the alignment of a value.
//!
//! Hazard slots and stack heads are hammered by every thread, so they are
//! kept on separate cache lines.

use core::fmt;
use core::ops::{Deref, DerefMut};

/// A value aligned (and padded) to a typical cache line.
pub type CachePadded<T> = Aligned<T, Alignment64>;
/// A value aligned to 128 bytes (adjacent line prefetching on x86_64).
pub type Aligned128<T> = Aligned<T, Alignment128>;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Aligned
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A value of type `T` with at least the alignment of `A`.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Aligned<T, A: Alignment> {
    inner: T,
    _align: A,
}

/********** impl inherent *************************************************************************/

impl<T, A: Alignment> Aligned<T, A> {
    /// Wraps `inner` with the alignment of `A`.
    #[inline]
    pub const fn new(inner: T) -> Self {
        Self { inner, _align: A::ALIGN }
    }

    /// Consumes `self` and returns the wrapped value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/********** impl Deref ****************************************************************************/

impl<T, A: Alignment> Deref for Aligned<T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T, A: Alignment> DerefMut for Aligned<T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Alignment (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Zero-sized marker types with a fixed alignment.
pub trait Alignment:
    Copy + Clone + Default + fmt::Debug + Eq + Ord + PartialEq + PartialOrd
{
    /// The (only) value of the marker type, usable in `const` contexts.
    const ALIGN: Self;
}

macro_rules! impl_alignment {
    ( $( $id:ident => $align:expr ),+ ) => {
        $(
            #[doc = concat!("A marker type with an alignment of ", stringify!($align), " bytes.")]
            #[derive(Copy, Clone, Default, Debug, Eq, Ord, PartialEq, PartialOrd)]
            #[repr(align($align))]
            pub struct $id;

            impl Alignment for $id {
                const ALIGN: Self = $id;
            }
        )*
    };
}

impl_alignment! {
    Alignment8   => 0x8,
    Alignment16  => 0x10,
    Alignment32  => 0x20,
    Alignment64  => 0x40,
    Alignment128 => 0x80
}
