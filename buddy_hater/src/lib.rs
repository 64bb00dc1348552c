#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_arena::{AllocInitError, Allocator, BuddyAllocator, Global};

/// A [`BuddyAllocator`] under evaluation.
///
/// Contract violations on deallocation panic, so the evaluator cannot mistake
/// a rejected free for a successful one.
pub struct BuddySubject<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator = Global>(
    BuddyAllocator<CAPACITY, BLOCK_SIZE, A>,
);

impl<const CAPACITY: usize, const BLOCK_SIZE: usize> BuddySubject<CAPACITY, BLOCK_SIZE> {
    pub fn new() -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new()?;
        Ok(BuddySubject(b))
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator>
    BuddySubject<CAPACITY, BLOCK_SIZE, A>
{
    pub fn new_in(upstream: A) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new_in(upstream)?;
        Ok(BuddySubject(b))
    }

    pub fn allocator(&self) -> &BuddyAllocator<CAPACITY, BLOCK_SIZE, A> {
        &self.0
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> Subject
    for BuddySubject<CAPACITY, BLOCK_SIZE, A>
{
    type AllocError = buddy_arena::AllocError;

    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size, align)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        if let Err(e) = unsafe { self.0.deallocate(ptr, size, align) } {
            panic!("deallocation rejected: {e}");
        }
    }
}
