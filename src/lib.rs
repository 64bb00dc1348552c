//! A fixed-capacity binary-buddy arena allocator.
//!
//! The centerpiece of this crate is [`BuddyAllocator`], which acquires a
//! single arena from an upstream [`Allocator`] and serves power-of-two-sized
//! blocks out of it. Bookkeeping is limited to one bit per node of the
//! conceptual block tree and one free list per block order; the arena itself
//! is never written by the allocator.
//!
//! Upstream memory can come from:
//! - [`PageProvider`], which maps pages directly from the operating system
//!   (Unix only),
//! - [`Global`], the Rust global allocator (requires the `alloc` feature),
//! - any other type implementing [`Allocator`], including trait objects such as
//!   `&mut dyn Allocator`.

#![doc(html_root_url = "https://docs.rs/buddy_arena/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that are
// provided natively by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod counting;
mod free_list;
#[cfg(unix)]
mod page;
mod polyfill;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{buddy::BuddyAllocator, counting::CountingAllocator};

#[cfg(unix)]
pub use crate::page::{page_size, PageProvider};

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to obtain its
    /// managed region from the upstream allocator, but the upstream allocator
    /// fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the memory required by an allocator's
    /// configuration cannot be described by a [`Layout`].
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "upstream allocation of {} bytes (align {}) failed",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

/// The error type for a deallocation that violates the allocator contract.
///
/// Each variant denotes a programmer error on the caller's side. Continuing
/// after such an error without fixing the caller would corrupt the
/// allocator's bookkeeping, so none of these are ever silently ignored.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeallocError {
    /// The pointer does not lie within the allocator's managed region.
    NotOwned,
    /// The size and alignment could not have produced an allocation.
    InvalidLayout,
    /// The pointer is not the start of a block of the given size.
    Misaligned,
    /// No block of the given size is currently allocated at the pointer.
    ///
    /// This is returned on double frees, and when a block is freed with a
    /// smaller size than it was allocated with.
    NotAllocated,
    /// The block at the pointer was allocated with a smaller size.
    SizeMismatch,
}

impl fmt::Display for DeallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DeallocError::NotOwned => "pointer is not owned by this allocator",
            DeallocError::InvalidLayout => "size and alignment do not describe an allocation",
            DeallocError::Misaligned => "pointer is not aligned to the block size",
            DeallocError::NotAllocated => "no block of this size is allocated at the pointer",
            DeallocError::SizeMismatch => "block was allocated with a smaller size",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DeallocError {}

/// A source of memory.
///
/// This is the contract shared by every allocator in this crate: the
/// [`BuddyAllocator`] implements it, and requires it of the upstream
/// allocator which supplies its arena.
///
/// The trait is object safe, so `&mut dyn Allocator` and (with the `alloc`
/// feature) `Box<dyn Allocator>` may be used wherever an `Allocator` is
/// expected.
pub trait Allocator {
    /// Attempts to allocate a block of memory of `size` bytes aligned to
    /// `align` bytes.
    ///
    /// On success, returns a pointer to the start of the block whose length is
    /// `size`. The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError)` if the request cannot be satisfied. This is an
    /// expected outcome and never indicates a bug.
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError>;

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must denote a block of memory currently allocated via this
    ///   allocator.
    /// - `size` and `align` must be the values the block was allocated with.
    /// - The block must not be accessed after this call.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// An [`Allocator`] which can tell whether a pointer falls within the memory it
/// manages.
pub trait OwningAllocator: Allocator {
    /// Returns `true` if `ptr` lies within the memory managed by this
    /// allocator.
    ///
    /// This is a bounds check only. It does not indicate whether `ptr` is the
    /// start of a currently allocated block.
    fn owns(&self, ptr: NonNull<u8>) -> bool;
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        (**self).allocate(size, align)
    }

    #[inline]
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        unsafe { (**self).deallocate(ptr, size, align) }
    }
}

impl<A: OwningAllocator + ?Sized> OwningAllocator for &mut A {
    #[inline]
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        (**self).owns(ptr)
    }
}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
impl<A: Allocator + ?Sized> Allocator for alloc::boxed::Box<A> {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        (**self).allocate(size, align)
    }

    #[inline]
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        unsafe { (**self).deallocate(ptr, size, align) }
    }
}

/// The global memory allocator.
///
/// Requests are forwarded to the allocator registered with
/// `#[global_allocator]`.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Copy, Clone, Debug, Default)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Allocator for Global {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| AllocError)?;

        // SAFETY: `layout` has a nonzero size.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError)?;

        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, align);
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Rounds `pos` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` on overflow.
#[inline]
#[cfg_attr(not(unix), allow(dead_code))]
const fn align_up(pos: usize, align: usize) -> Option<usize> {
    match pos.checked_add(align - 1) {
        Some(p) => Some(p & !(align - 1)),
        None => None,
    }
}
