//! A small library for ~~hating on~~ evaluating the correctness of allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, mem::MaybeUninit, ptr::NonNull, slice};

/// The greatest request size generated by [`ArbRequest`].
pub const MAX_SIZE: usize = 1 << 16;

/// The greatest alignment generated by [`ArbRequest`], expressed in bits.
pub const MAX_ALIGN_SHIFT: u8 = 15;

/// An allocation request of `size` bytes aligned to `align`.
///
/// `align` is always a power of two. `size` may be zero, which a well-behaved
/// subject must reject.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArbRequest {
    pub size: usize,
    pub align: usize,
}

impl arbitrary::Arbitrary<'_> for ArbRequest {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % (MAX_ALIGN_SHIFT + 1);
        let align: usize = 1 << align_shift;

        let size = usize::arbitrary(u)? % (MAX_SIZE + 1);

        Ok(ArbRequest { size, align })
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    Alloc(ArbRequest),
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbRequest::arbitrary(u)?),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of memory of `size` bytes aligned to `align`.
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `size` and `align`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The original request.
    req: ArbRequest,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - `ptr` must have been allocated according to `req`.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, req: ArbRequest, id: u64) -> Block {
        let mut b = Block { ptr, req, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { &*slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, ArbRequest) {
        (self.ptr, self.req)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

/// Why an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// A block was returned with the wrong length.
    WrongLength { expected: usize, actual: usize },
    /// A block was returned at an address that violates the requested
    /// alignment.
    Misaligned,
    /// A zero-size request succeeded.
    ZeroSizeAccepted,
    /// A block was overwritten while it was allocated.
    Overwritten,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::WrongLength { expected, actual } => {
                write!(f, "block has length {actual}, expected {expected}")
            }
            FailureKind::Misaligned => f.write_str("block is misaligned"),
            FailureKind::ZeroSizeAccepted => f.write_str("zero-size request succeeded"),
            FailureKind::Overwritten => f.write_str("block was overwritten"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    /// The failing operation, or `None` if the failure was detected while
    /// releasing the blocks left outstanding at the end.
    pub failed_op: Option<AllocatorOp>,
    pub kind: FailureKind,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Returns a reference to the allocator under evaluation.
    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let fail = |completed, kind| Failed {
                completed,
                failed_op: Some(op.clone()),
                kind,
            };

            match op {
                AllocatorOp::Alloc(req) => {
                    let ptr = match self.subject.allocate(req.size, req.align) {
                        Ok(p) => p,
                        Err(_) => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if req.size == 0 {
                        return Err(fail(completed, FailureKind::ZeroSizeAccepted));
                    }

                    if ptr.len() != req.size {
                        let kind = FailureKind::WrongLength {
                            expected: req.size,
                            actual: ptr.len(),
                        };
                        return Err(fail(completed, kind));
                    }

                    if ptr.cast::<u8>().as_ptr() as usize % req.align != 0 {
                        return Err(fail(completed, FailureKind::Misaligned));
                    }

                    let block = unsafe { Block::init(ptr, req, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if !block.verify() {
                        return Err(fail(completed, FailureKind::Overwritten));
                    }

                    block.paint(op_id);
                    let (ptr, req) = block.into_raw_parts();
                    unsafe { self.subject.deallocate(ptr.cast(), req.size, req.align) };
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    kind: FailureKind::Overwritten,
                });
            }

            let (ptr, req) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr.cast(), req.size, req.align) };
        }

        Ok(())
    }
}
