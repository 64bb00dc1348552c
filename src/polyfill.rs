//! Strict-provenance polyfills.
//!
//! Newer toolchains provide these methods natively; the inherent methods take
//! precedence there and this module goes unused.

use core::{num::NonZeroUsize, ptr::NonNull};

#[allow(unused_imports)]
use sptr::Strict;

#[allow(dead_code)]
pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }
}
