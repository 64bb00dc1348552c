use core::ptr::NonNull;

use crate::{AllocError, Allocator, OwningAllocator};

/// An allocator adapter which counts calls to the allocator it wraps.
///
/// Every call to [`allocate`](Allocator::allocate) or
/// [`deallocate`](Allocator::deallocate) is counted, whether or not it
/// succeeds, and then forwarded to the inner allocator.
///
/// This is mostly useful for checking how another allocator uses its upstream.
/// Pass `&mut CountingAllocator<A>` as the upstream so that the counts remain
/// readable after the downstream allocator is dropped:
///
/// ```
/// use buddy_arena::{BuddyAllocator, CountingAllocator, Global};
///
/// let mut counter = CountingAllocator::new(Global);
///
/// {
///     let mut buddy = BuddyAllocator::<4096, 16, _>::try_new_in(&mut counter).unwrap();
///     let block = buddy.allocate(64, 8).unwrap();
///     unsafe { buddy.deallocate(block.cast(), 64, 8).unwrap() };
/// }
///
/// assert_eq!(counter.alloc_count(), 1);
/// assert_eq!(counter.dealloc_count(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct CountingAllocator<A: Allocator> {
    inner: A,
    allocs: usize,
    deallocs: usize,
}

impl<A: Allocator> CountingAllocator<A> {
    /// Wraps `inner` with zeroed counters.
    pub fn new(inner: A) -> CountingAllocator<A> {
        CountingAllocator {
            inner,
            allocs: 0,
            deallocs: 0,
        }
    }

    /// Returns the number of calls to `allocate`.
    #[inline]
    pub fn alloc_count(&self) -> usize {
        self.allocs
    }

    /// Returns the number of calls to `deallocate`.
    #[inline]
    pub fn dealloc_count(&self) -> usize {
        self.deallocs
    }

    /// Returns a reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Consumes the adapter, returning the inner allocator.
    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocs += 1;
        self.inner.allocate(size, align)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.deallocs += 1;
        unsafe { self.inner.deallocate(ptr, size, align) }
    }
}

impl<A: OwningAllocator> OwningAllocator for CountingAllocator<A> {
    #[inline]
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.inner.owns(ptr)
    }
}
