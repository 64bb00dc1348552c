use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Every pointer handed out by the allocator is derived from this one, so that
/// it carries the provenance of the whole region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` spanning `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region would overflow `usize`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> usize {
        // Cannot overflow; checked in `new`.
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` precedes the base address.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(addr));

        addr.get()
            .checked_sub(self.ptr.addr().get())
            .expect("address precedes region base")
    }

    /// Creates a new pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.extent);

        // SAFETY: `offset` is within the region, which was checked not to
        // wrap around the address space.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// Creates a new slice pointer of `len` bytes starting `offset` bytes past
    /// the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset_and_size(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset.checked_add(len).map_or(false, |end| end <= self.extent));

        let raw_slice = ptr::slice_from_raw_parts_mut(self.with_offset(offset).as_ptr(), len);

        // SAFETY: derived from a non-null pointer.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}
