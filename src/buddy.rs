//! A binary-buddy memory allocator.
//!
//! The arena is modeled as a complete binary tree of blocks. The root is the
//! whole arena, and the two children of any block are its halves. A block of
//! order `k` is `BLOCK_SIZE << k` bytes long, so the leaves are the order-0
//! blocks and the root has order `log2(CAPACITY / BLOCK_SIZE)`.
//!
//! Nodes are numbered in heap order: the root is node 0, and the children of
//! node `i` are nodes `2i + 1` and `2i + 2`. One bit per node records whether
//! the node is unavailable as a whole block, either because it has been
//! handed out or because it has been split. Free blocks that cannot be
//! coalesced are kept on one free list per order.
//!
//! Each node is in one of three states:
//!
//! | State     | Node bit | Children bits      | On a free list |
//! |-----------|----------|--------------------|----------------|
//! | Free      | clear    | clear              | yes            |
//! | Allocated | set      | clear              | no             |
//! | Split     | set      | at least one set   | no             |
//!
//! (Nodes strictly inside a free block are also clear and on no list; they
//! are not considered to exist until their ancestor is split.)

use core::{
    alloc::{Layout, LayoutError},
    cmp, fmt,
    ptr::NonNull,
};

use log::{debug, trace, warn};

use crate::{
    base::BasePtr,
    bitmap::Bitmap,
    free_list::{FreeLink, FreeLists, MAX_LEAVES, MAX_ORDERS},
    AllocError, AllocInitError, Allocator, DeallocError, OwningAllocator,
};

#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;
#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Where the arena and its metadata live inside the upstream allocation.
#[derive(Copy, Clone, Debug)]
struct RegionLayout {
    full: Layout,
    nodes_ofs: usize,
    links_ofs: usize,
}

/// A binary-buddy allocator.
///
/// This takes two const parameters:
/// - `CAPACITY` is the size of the arena in bytes, and thus of the largest
///   allocation the allocator can make.
/// - `BLOCK_SIZE` is the size of the smallest allocation the allocator can
///   make. Smaller requests are rounded up to it.
///
/// Both must be powers of two, and `BLOCK_SIZE` must be less than
/// `CAPACITY`. Naming a `BuddyAllocator` constructor with parameters that
/// violate these invariants is a compile-time error.
///
/// The arena and the allocator's metadata are obtained from the upstream
/// allocator `A` in a single request when the allocator is constructed, and
/// returned to it in a single call when the allocator is dropped. The
/// allocator never writes to the arena.
///
/// For example, the type of a buddy allocator which manages 64 KiB in blocks
/// of 16 bytes to 64 KiB, backed by the global allocator, would be:
///
/// ```
/// use buddy_arena::{BuddyAllocator, Global};
///
/// type CustomBuddyAllocator = BuddyAllocator<65536, 16, Global>;
///
/// let mut buddy = CustomBuddyAllocator::new();
/// let block = buddy.allocate(100, 8).unwrap();
/// assert!(buddy.owns(block.cast()));
///
/// unsafe { buddy.deallocate(block.cast(), 100, 8).unwrap() };
/// assert!(buddy.is_idle());
/// ```
///
/// # Thread safety
///
/// The allocator performs no internal synchronization. It is neither `Send`
/// nor `Sync`; wrap it in a lock, or use one allocator per thread, to share
/// allocation capacity between threads.
pub struct BuddyAllocator<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> {
    /// Pointer to the arena managed by this allocator.
    base: BasePtr,
    /// Layout of the upstream allocation, which starts with the arena.
    region: RegionLayout,
    /// One bit per tree node; set if the node is allocated or split.
    nodes: Bitmap,
    /// Free blocks which cannot be coalesced, by order.
    free: FreeLists,
    upstream: A,
}

#[cfg(any(feature = "alloc", test))]
impl<const CAPACITY: usize, const BLOCK_SIZE: usize> BuddyAllocator<CAPACITY, BLOCK_SIZE, Global> {
    /// Constructs a new `BuddyAllocator` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// If allocation fails, this constructor invokes [`handle_alloc_error`].
    ///
    /// [`handle_alloc_error`]: alloc::alloc::handle_alloc_error
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    #[allow(clippy::new_without_default)]
    pub fn new() -> BuddyAllocator<CAPACITY, BLOCK_SIZE, Global> {
        match Self::try_new() {
            Ok(buddy) => buddy,
            Err(AllocInitError::AllocFailed(layout)) => alloc::alloc::handle_alloc_error(layout),
            Err(e) => panic!("failed to construct buddy allocator: {e}"),
        }
    }

    /// Attempts to construct a new `BuddyAllocator` backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the global allocator cannot supply the arena.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new() -> Result<BuddyAllocator<CAPACITY, BLOCK_SIZE, Global>, AllocInitError> {
        Self::try_new_in(Global)
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator>
    BuddyAllocator<CAPACITY, BLOCK_SIZE, A>
{
    const VALID_CONFIG: () = {
        assert!(
            CAPACITY.is_power_of_two(),
            "buddy allocator capacity must be a power of two"
        );
        assert!(
            BLOCK_SIZE.is_power_of_two(),
            "buddy allocator block size must be a power of two"
        );
        assert!(
            BLOCK_SIZE < CAPACITY,
            "buddy allocator block size must be less than its capacity"
        );
    };

    /// The number of minimum-size blocks in the arena.
    const BLOCK_COUNT: usize = CAPACITY / BLOCK_SIZE;

    /// The order of the root block.
    const MAX_ORDER: usize = Self::BLOCK_COUNT.trailing_zeros() as usize;

    /// The number of nodes in the block tree.
    const NUM_NODES: usize = 2 * Self::BLOCK_COUNT - 1;

    /// The alignment of the arena. Every block is aligned to its own length.
    const ARENA_ALIGN: usize = CAPACITY;

    /// Constructs a new `BuddyAllocator` whose arena is obtained from
    /// `upstream`.
    ///
    /// `upstream` is called exactly once here, and once more when the
    /// allocator is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AllocFailed`] if `upstream` cannot supply the
    /// arena, or [`AllocInitError::InvalidConfig`] if the arena and its
    /// metadata are too large to be described by a [`Layout`] or the arena
    /// holds more than `u32::MAX - 1` minimum-size blocks. `upstream` is not
    /// called in the latter cases.
    pub fn try_new_in(
        mut upstream: A,
    ) -> Result<BuddyAllocator<CAPACITY, BLOCK_SIZE, A>, AllocInitError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_CONFIG;

        debug_assert!(Self::MAX_ORDER < MAX_ORDERS);

        if Self::BLOCK_COUNT >= MAX_LEAVES {
            return Err(AllocInitError::InvalidConfig);
        }

        let region = Self::region_layout().map_err(|_| AllocInitError::InvalidConfig)?;

        let ptr = upstream
            .allocate(region.full.size(), region.full.align())
            .map_err(|AllocError| AllocInitError::AllocFailed(region.full))?
            .cast::<u8>();

        let base = match BasePtr::new(ptr, CAPACITY) {
            Some(b) => b,
            None => {
                // SAFETY: just allocated with this layout, and never accessed.
                unsafe { upstream.deallocate(ptr, region.full.size(), region.full.align()) };
                return Err(AllocInitError::InvalidConfig);
            }
        };

        // SAFETY: the metadata lies within the upstream allocation, is suitably
        // aligned per `region_layout`, and is only accessed through `nodes` and
        // `free`.
        let (nodes, mut free) = unsafe {
            let nodes_ptr = ptr.as_ptr().add(region.nodes_ofs).cast::<u64>();
            let links_ptr = ptr.as_ptr().add(region.links_ofs).cast::<FreeLink>();

            (
                Bitmap::new(Self::NUM_NODES, nodes_ptr),
                FreeLists::new(Self::BLOCK_COUNT, links_ptr),
            )
        };

        // The whole arena starts out as a single free root block.
        free.push(Self::MAX_ORDER, 0);

        debug!(
            "buddy allocator: arena of {} bytes at {:#x}, block sizes {}..={} ({} orders)",
            CAPACITY,
            ptr.addr().get(),
            BLOCK_SIZE,
            CAPACITY,
            Self::MAX_ORDER + 1,
        );

        Ok(BuddyAllocator {
            base,
            region,
            nodes,
            free,
            upstream,
        })
    }

    /// Returns the layout of the upstream allocation: the arena, followed by
    /// the node bitmap and the free list links.
    fn region_layout() -> Result<RegionLayout, LayoutError> {
        let arena = Layout::from_size_align(CAPACITY, Self::ARENA_ALIGN)?;
        let (with_nodes, nodes_ofs) = arena.extend(Bitmap::map_layout(Self::NUM_NODES)?)?;
        let (full, links_ofs) = with_nodes.extend(FreeLists::links_layout(Self::BLOCK_COUNT)?)?;

        Ok(RegionLayout {
            full,
            nodes_ofs,
            links_ofs,
        })
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Returns the size of the smallest block in bytes.
    #[inline]
    pub const fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Returns the order of the largest block, which spans the whole arena.
    #[inline]
    pub const fn max_order(&self) -> usize {
        Self::MAX_ORDER
    }

    /// Returns the alignment of the arena, which equals its capacity.
    ///
    /// Requests for a greater alignment always fail.
    #[inline]
    pub const fn max_align(&self) -> usize {
        Self::ARENA_ALIGN
    }

    /// Returns a reference to the upstream allocator.
    #[inline]
    pub fn upstream(&self) -> &A {
        &self.upstream
    }

    /// Returns the order of the block that serves a request of `size` bytes
    /// aligned to `align`, or `None` if no block can serve it.
    ///
    /// The block length is the smallest power of two that is no less than
    /// `size`, `align` or `BLOCK_SIZE`. Blocks are aligned to their own length
    /// relative to the arena base, so any alignment up to the arena's own
    /// alignment can be honored this way.
    fn order_for(size: usize, align: usize) -> Option<usize> {
        if size == 0 || !align.is_power_of_two() || align > Self::ARENA_ALIGN {
            return None;
        }

        let len = cmp::max(cmp::max(size, align), BLOCK_SIZE).checked_next_power_of_two()?;
        if len > CAPACITY {
            return None;
        }

        Some((len / BLOCK_SIZE).trailing_zeros() as usize)
    }

    /// Returns the index of the tree node of `order` whose first leaf is
    /// `leaf`.
    #[inline]
    fn node_index(leaf: usize, order: usize) -> usize {
        debug_assert!(order <= Self::MAX_ORDER);
        debug_assert_eq!(leaf & ((1 << order) - 1), 0, "leaf not aligned to order");

        // Nodes of depth `d` occupy indices `2^d - 1 .. 2^(d + 1) - 1`.
        let depth = Self::MAX_ORDER - order;
        (1 << depth) - 1 + (leaf >> order)
    }

    /// Attempts to allocate a block of memory.
    ///
    /// On success, returns a [`NonNull<[u8]>`] of length `size`, aligned to
    /// `align`. The underlying block is `size` rounded up to a power of two,
    /// and at least `BLOCK_SIZE` and `align` bytes long.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError)` if:
    /// - `size` is zero,
    /// - `align` is not a power of two, or exceeds [`max_align()`],
    /// - the rounded size exceeds `CAPACITY`, or
    /// - no free block is large enough.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    /// [`max_align()`]: Self::max_align
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        let target = Self::order_for(size, align).ok_or_else(|| {
            trace!("buddy allocator: unsupported request size={size} align={align}");
            AllocError
        })?;

        // Find the smallest free block that is large enough.
        let mut order = (target..=Self::MAX_ORDER)
            .find(|&o| !self.free.is_empty(o))
            .ok_or_else(|| {
                trace!("buddy allocator: no free block of order {target} or above");
                AllocError
            })?;

        let leaf = self.free.pop(order).ok_or(AllocError)?;
        self.nodes.set(Self::node_index(leaf, order), true);

        // Split the block repeatedly to obtain a suitably sized block. The
        // front half is kept, so the address does not change.
        while order > target {
            order -= 1;

            self.free.push(order, leaf + (1 << order));
            self.nodes.set(Self::node_index(leaf, order), true);
        }

        // The returned block inherits the provenance of the base pointer.
        Ok(self.base.with_offset_and_size(leaf * BLOCK_SIZE, size))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// The block is coalesced with its buddy, and the result with its own
    /// buddy, for as long as the buddy is free.
    ///
    /// # Errors
    ///
    /// Returns a [`DeallocError`] describing the contract violation if `ptr`,
    /// `size` and `align` do not denote a currently allocated block. The
    /// allocator is left unchanged in that case.
    ///
    /// # Safety
    ///
    /// The caller must not access the block after it is deallocated.
    pub unsafe fn deallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<(), DeallocError> {
        let (mut leaf, mut order) = self
            .find_allocated(ptr, size, align)
            .map_err(|e| {
                warn!(
                    "buddy allocator: rejected deallocation of {:#x} (size={size}, align={align}): {e}",
                    ptr.addr().get()
                );
                e
            })?;

        let mut node = Self::node_index(leaf, order);
        self.nodes.set(node, false);

        while order < Self::MAX_ORDER {
            let buddy = leaf ^ (1 << order);
            if self.nodes.get(Self::node_index(buddy, order)) {
                break;
            }

            // The buddy is free: take it off its list and merge with it.
            self.free.remove(order, buddy);
            leaf &= !(1 << order);
            order += 1;

            node = (node - 1) / 2;
            self.nodes.set(node, false);
        }

        self.free.push(order, leaf);

        Ok(())
    }

    /// Locates the allocated block denoted by `ptr`, `size` and `align`.
    ///
    /// Returns the block's leaf and order.
    fn find_allocated(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<(usize, usize), DeallocError> {
        if !self.base.contains_addr(ptr.addr()) {
            return Err(DeallocError::NotOwned);
        }

        let order = Self::order_for(size, align).ok_or(DeallocError::InvalidLayout)?;

        let ofs = self.base.offset_to(ptr.addr());
        if ofs % (BLOCK_SIZE << order) != 0 {
            return Err(DeallocError::Misaligned);
        }

        let leaf = ofs / BLOCK_SIZE;
        let node = Self::node_index(leaf, order);

        if !self.nodes.get(node) {
            return Err(DeallocError::NotAllocated);
        }

        // A split node always has at least one unavailable child; an
        // allocated node never does.
        if order > 0 && (self.nodes.get(2 * node + 1) || self.nodes.get(2 * node + 2)) {
            return Err(DeallocError::SizeMismatch);
        }

        Ok((leaf, order))
    }

    /// Returns `true` if `ptr` lies within the arena.
    ///
    /// This is a bounds check only; it does not indicate whether `ptr` is the
    /// start of an allocated block.
    #[inline]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Returns the number of free blocks of `order` that cannot be coalesced
    /// further.
    ///
    /// # Panics
    ///
    /// Panics if `order` exceeds [`max_order()`](Self::max_order).
    pub fn free_blocks(&self, order: usize) -> usize {
        assert!(order <= Self::MAX_ORDER, "order out of range");

        self.free.len(order)
    }

    /// Returns the total size in bytes of all free blocks.
    pub fn free_bytes(&self) -> usize {
        (0..=Self::MAX_ORDER)
            .map(|order| self.free.len(order) * (BLOCK_SIZE << order))
            .sum()
    }

    /// Returns `true` if no blocks are allocated.
    ///
    /// This holds exactly when the whole arena has coalesced back into the
    /// single free root block.
    pub fn is_idle(&self) -> bool {
        self.free.len(Self::MAX_ORDER) == 1 && !self.nodes.any()
    }

    /// Asserts that no blocks are allocated.
    ///
    /// This check is only performed in builds with debug assertions enabled.
    /// It is meant to catch leaked allocations in tests, before the allocator
    /// is dropped.
    #[track_caller]
    pub fn debug_assert_idle(&self) {
        debug_assert!(
            self.is_idle(),
            "buddy allocator has {} free bytes out of {}",
            self.free_bytes(),
            CAPACITY
        );
    }

    /// Returns the number of unavailable (allocated or split) tree nodes.
    #[cfg(test)]
    fn unavailable_nodes(&self) -> usize {
        self.nodes.count_ones()
    }

    /// Returns the leaves of the free blocks of `order`, most recently freed
    /// first.
    #[cfg(test)]
    fn free_leaves(&self, order: usize) -> impl Iterator<Item = usize> + '_ {
        self.free.iter(order)
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> Drop
    for BuddyAllocator<CAPACITY, BLOCK_SIZE, A>
{
    fn drop(&mut self) {
        if !self.is_idle() {
            warn!(
                "buddy allocator dropped with {} of {} bytes still allocated",
                CAPACITY - self.free_bytes(),
                CAPACITY
            );
        }

        debug!(
            "buddy allocator: releasing arena at {:#x}",
            self.base.ptr().addr().get()
        );

        let full = self.region.full;

        // SAFETY: the region was allocated by `upstream` with this layout, and
        // nothing refers to it once the allocator is gone.
        unsafe {
            self.upstream
                .deallocate(self.base.ptr(), full.size(), full.align())
        };
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> Allocator
    for BuddyAllocator<CAPACITY, BLOCK_SIZE, A>
{
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        BuddyAllocator::allocate(self, size, align)
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr`, `size` and `align` do not denote a currently allocated
    /// block.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        if let Err(e) = unsafe { BuddyAllocator::deallocate(self, ptr, size, align) } {
            panic!("buddy allocator contract violation: {e}");
        }
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> OwningAllocator
    for BuddyAllocator<CAPACITY, BLOCK_SIZE, A>
{
    #[inline]
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        BuddyAllocator::owns(self, ptr)
    }
}

impl<const CAPACITY: usize, const BLOCK_SIZE: usize, A: Allocator> fmt::Debug
    for BuddyAllocator<CAPACITY, BLOCK_SIZE, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &self.base.ptr())
            .field("capacity", &CAPACITY)
            .field("block_size", &BLOCK_SIZE)
            .field("free_bytes", &self.free_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::mem;
    use std::prelude::rust_2021::*;

    use super::*;
    use crate::CountingAllocator;

    const WORD: usize = mem::size_of::<u32>();

    /// Writes `value` to the first word of the block at `ptr`.
    unsafe fn mark(ptr: NonNull<[u8]>, value: u32) {
        unsafe { ptr.cast::<u32>().as_ptr().write(value) };
    }

    /// Reads the first word of the block at `ptr`.
    unsafe fn read_mark(ptr: NonNull<[u8]>) -> u32 {
        unsafe { ptr.cast::<u32>().as_ptr().read() }
    }

    fn range_of(ptr: NonNull<[u8]>) -> core::ops::Range<usize> {
        let start = ptr.cast::<u8>().addr().get();
        start..start + ptr.len()
    }

    fn disjoint(a: &core::ops::Range<usize>, b: &core::ops::Range<usize>) -> bool {
        a.end <= b.start || b.end <= a.start
    }

    #[test]
    fn create_and_destroy() {
        let buddy = BuddyAllocator::<4096, 16, Global>::new();

        assert_eq!(buddy.capacity(), 4096);
        assert_eq!(buddy.block_size(), 16);
        assert_eq!(buddy.max_order(), 8);
        assert_eq!(buddy.max_align(), 4096);
        assert!(buddy.is_idle());
        assert_eq!(buddy.free_bytes(), 4096);
        assert_eq!(buddy.free_blocks(8), 1);
        assert_eq!(buddy.unavailable_nodes(), 0);
    }

    #[test]
    fn order_for_rounds_up() {
        type B = BuddyAllocator<128, 4, Global>;

        assert_eq!(B::order_for(1, 1), Some(0));
        assert_eq!(B::order_for(4, 4), Some(0));
        assert_eq!(B::order_for(5, 1), Some(1));
        assert_eq!(B::order_for(8, 4), Some(1));
        assert_eq!(B::order_for(33, 4), Some(4));
        assert_eq!(B::order_for(128, 4), Some(5));

        // Alignment larger than the size widens the block.
        assert_eq!(B::order_for(4, 32), Some(3));

        assert_eq!(B::order_for(0, 4), None);
        assert_eq!(B::order_for(129, 4), None);
        assert_eq!(B::order_for(usize::MAX, 1), None);
        assert_eq!(B::order_for(4, 3), None);
        assert_eq!(B::order_for(4, 256), None);
    }

    #[test]
    fn node_index_is_heap_ordered() {
        type B = BuddyAllocator<32, 4, Global>;

        // Root.
        assert_eq!(B::node_index(0, 3), 0);
        // Order 2: two halves.
        assert_eq!(B::node_index(0, 2), 1);
        assert_eq!(B::node_index(4, 2), 2);
        // Order 1.
        assert_eq!(B::node_index(0, 1), 3);
        assert_eq!(B::node_index(6, 1), 6);
        // Leaves.
        assert_eq!(B::node_index(0, 0), 7);
        assert_eq!(B::node_index(7, 0), 14);
    }

    #[test]
    fn split_marks_path_and_files_buddies() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();

        let a = buddy.allocate(4, 4).unwrap();
        assert_eq!(buddy.base.offset_to(a.cast::<u8>().addr()), 0);

        // The root was split down to a leaf: one node per order is unavailable,
        // and one right half was filed on each lower order's free list.
        assert_eq!(buddy.unavailable_nodes(), 6);
        for order in 0..5 {
            assert_eq!(buddy.free_leaves(order).collect::<Vec<_>>(), [1 << order]);
        }
        assert_eq!(buddy.free_blocks(5), 0);
        assert_eq!(buddy.free_bytes(), 128 - 4);

        unsafe { buddy.deallocate(a.cast(), 4, 4).unwrap() };
        assert!(buddy.is_idle());
    }

    #[test]
    fn alloc_write_and_free() {
        let mut buddy = BuddyAllocator::<8192, 8, Global>::new();

        let size = 64;
        let ptr = buddy.allocate(size, 1).unwrap();

        unsafe {
            {
                // Do this in a separate scope so that the slice no longer
                // exists when ptr is freed.
                let buf: &mut [u8] = &mut *ptr.as_ptr();
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = i as u8;
                }
            }

            buddy.deallocate(ptr.cast(), size, 1).unwrap();
        }

        buddy.debug_assert_idle();
    }

    #[test]
    fn disjoint_sizes_in_bounds() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();

        let sizes = [4, 8, 16, 32];
        let blocks: Vec<_> = sizes
            .iter()
            .map(|&size| buddy.allocate(size, WORD).unwrap())
            .collect();

        let base = buddy.base.ptr().addr().get();
        let ranges: Vec<_> = blocks.iter().map(|&b| range_of(b)).collect();

        for (i, r) in ranges.iter().enumerate() {
            assert!(r.start >= base && r.end <= base + 128, "block {i} out of bounds");
            assert!(buddy.owns(blocks[i].cast()));

            for other in &ranges[i + 1..] {
                assert!(disjoint(r, other), "blocks overlap: {r:?} {other:?}");
            }
        }

        // Fill every block entirely with its index, then check all of them.
        for (i, (&block, &size)) in blocks.iter().zip(&sizes).enumerate() {
            for w in 0..size / WORD {
                unsafe { block.cast::<u32>().as_ptr().add(w).write(i as u32) };
            }
        }

        for (i, (&block, &size)) in blocks.iter().zip(&sizes).enumerate() {
            for w in 0..size / WORD {
                assert_eq!(unsafe { block.cast::<u32>().as_ptr().add(w).read() }, i as u32);
            }
        }

        for (&block, &size) in blocks.iter().zip(&sizes) {
            unsafe { buddy.deallocate(block.cast(), size, WORD).unwrap() };
        }

        assert!(buddy.is_idle());
    }

    #[test]
    fn toggled_alloc_dealloc() {
        let mut buddy = BuddyAllocator::<{ 32 * 4 }, 4, Global>::new();

        let sizes = [4, 8, 16, 32];
        let mut blocks: [Option<NonNull<[u8]>>; 4] = [None; 4];

        for i in [3, 0, 1, 0, 2, 1, 3, 2] {
            match blocks[i].take() {
                Some(block) => unsafe {
                    assert_eq!(read_mark(block), i as u32, "block {i} was overwritten");
                    buddy.deallocate(block.cast(), sizes[i], WORD).unwrap();
                },

                None => {
                    let block = buddy.allocate(sizes[i], WORD).unwrap();
                    unsafe { mark(block, i as u32) };
                    blocks[i] = Some(block);
                }
            }

            let live: usize = blocks
                .iter()
                .zip(&sizes)
                .filter(|(b, _)| b.is_some())
                .map(|(_, &s)| s)
                .sum();
            assert_eq!(buddy.free_bytes() + live, 128);
        }

        assert!(blocks.iter().all(Option::is_none));
        assert!(buddy.is_idle());
    }

    #[test]
    fn realloc_returns_same_address() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();

        // Split the arena so that free lists hold more than one candidate.
        let pin = buddy.allocate(16, WORD).unwrap();

        let a1 = buddy.allocate(WORD, WORD).unwrap();
        assert!(buddy.owns(a1.cast()));
        unsafe { buddy.deallocate(a1.cast(), WORD, WORD).unwrap() };

        let a2 = buddy.allocate(WORD, WORD).unwrap();
        assert_eq!(a1.cast::<u8>(), a2.cast::<u8>());

        unsafe {
            buddy.deallocate(a2.cast(), WORD, WORD).unwrap();
            buddy.deallocate(pin.cast(), 16, WORD).unwrap();
        }
        assert!(buddy.is_idle());
    }

    #[test]
    fn coalesce_one() {
        let mut buddy = BuddyAllocator::<16, 8, Global>::new();

        // Allocate two minimum-size blocks to split the root.
        let a = buddy.allocate(8, 8).unwrap();
        let b = buddy.allocate(8, 8).unwrap();
        assert_eq!(buddy.allocate(1, 1), Err(AllocError));

        unsafe {
            // Free both blocks, coalescing them.
            buddy.deallocate(a.cast(), 8, 8).unwrap();
            buddy.deallocate(b.cast(), 8, 8).unwrap();
        }

        // Allocate the entire region to ensure coalescing worked.
        let c = buddy.allocate(16, 8).unwrap();
        unsafe { buddy.deallocate(c.cast(), 16, 8).unwrap() };

        // Same as above, this time freeing in reverse order.
        let a = buddy.allocate(8, 8).unwrap();
        let b = buddy.allocate(8, 8).unwrap();
        unsafe {
            buddy.deallocate(b.cast(), 8, 8).unwrap();
            buddy.deallocate(a.cast(), 8, 8).unwrap();
        }

        let c = buddy.allocate(16, 8).unwrap();
        unsafe { buddy.deallocate(c.cast(), 16, 8).unwrap() };

        assert!(buddy.is_idle());
    }

    #[test]
    fn coalesce_many() {
        const CAPACITY: usize = 1024;
        const BLOCK_SIZE: usize = 8;

        let mut buddy = BuddyAllocator::<CAPACITY, BLOCK_SIZE, Global>::new();

        for order in 0..=buddy.max_order() {
            let alloc_size = BLOCK_SIZE << order;
            let num_allocs = CAPACITY / alloc_size;

            let mut allocs = Vec::with_capacity(num_allocs);
            for _ in 0..num_allocs {
                let ptr = buddy.allocate(alloc_size, BLOCK_SIZE).unwrap();

                unsafe {
                    let buf: &mut [u8] = &mut *ptr.as_ptr();
                    for (i, byte) in buf.iter_mut().enumerate() {
                        *byte = (i % 256) as u8;
                    }
                }

                allocs.push(ptr);
            }

            assert_eq!(buddy.free_bytes(), 0);
            assert_eq!(buddy.allocate(1, 1), Err(AllocError));

            // Free in an interleaved order so that coalescing happens late.
            let (evens, odds): (Vec<_>, Vec<_>) =
                allocs.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
            for (_, ptr) in evens.into_iter().chain(odds) {
                unsafe { buddy.deallocate(ptr.cast(), alloc_size, BLOCK_SIZE).unwrap() };
            }

            assert!(buddy.is_idle(), "order {order} did not coalesce");
        }
    }

    #[test]
    fn full_cycle_restores_root() {
        const CAPACITY: usize = 256;
        const BLOCK_SIZE: usize = 4;

        let mut buddy = BuddyAllocator::<CAPACITY, BLOCK_SIZE, Global>::new();

        let mut blocks: Vec<_> = (0..CAPACITY / BLOCK_SIZE)
            .map(|_| buddy.allocate(BLOCK_SIZE, BLOCK_SIZE).unwrap())
            .collect();

        // Free in a scrambled but deterministic order.
        let n = blocks.len();
        for i in 0..n {
            blocks.swap(i, (i * 37 + 11) % n);
        }
        for block in blocks {
            unsafe { buddy.deallocate(block.cast(), BLOCK_SIZE, BLOCK_SIZE).unwrap() };
        }

        let all = buddy.allocate(CAPACITY, BLOCK_SIZE).unwrap();
        assert_eq!(all.len(), CAPACITY);
        unsafe { buddy.deallocate(all.cast(), CAPACITY, BLOCK_SIZE).unwrap() };
        assert!(buddy.is_idle());
    }

    #[test]
    fn oversize_and_zero_rejected() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();

        assert_eq!(buddy.allocate(129, 4), Err(AllocError));
        assert_eq!(buddy.allocate(0, 4), Err(AllocError));
        assert_eq!(buddy.allocate(usize::MAX, 1), Err(AllocError));
        assert_eq!(buddy.allocate(4, 3), Err(AllocError));
        assert_eq!(buddy.allocate(4, 256), Err(AllocError));

        assert!(buddy.is_idle());
    }

    #[test]
    fn exhaustion_then_recovery() {
        const COUNT: usize = 32;

        let mut buddy = BuddyAllocator::<{ WORD * COUNT }, WORD, Global>::new();

        let blocks: Vec<_> = (0..COUNT)
            .map(|i| {
                let b = buddy.allocate(WORD, WORD).unwrap();
                assert!(buddy.owns(b.cast()), "allocation {i} is not owned");
                unsafe { mark(b, i as u32) };
                b
            })
            .collect();

        for size in [1, WORD, 2 * WORD, WORD * COUNT] {
            assert_eq!(buddy.allocate(size, 1), Err(AllocError));
        }

        for (i, &b) in blocks.iter().enumerate() {
            assert_eq!(unsafe { read_mark(b) }, i as u32, "allocation {i} overlaps");
        }

        unsafe { buddy.deallocate(blocks[17].cast(), WORD, WORD).unwrap() };
        let again = buddy.allocate(WORD, WORD).unwrap();
        assert_eq!(again.cast::<u8>(), blocks[17].cast::<u8>());

        for (i, &b) in blocks.iter().enumerate().rev() {
            assert_eq!(unsafe { read_mark(b) }, i as u32);
            unsafe { buddy.deallocate(b.cast(), WORD, WORD).unwrap() };
        }
        assert!(buddy.is_idle());
    }

    #[test]
    fn alignment_beyond_size() {
        let mut buddy = BuddyAllocator::<1024, 4, Global>::new();
        let base = buddy.base.ptr().addr().get();

        let _pin = buddy.allocate(4, 4).unwrap();
        let b = buddy.allocate(4, 64).unwrap();
        assert_eq!(b.len(), 4);
        assert_eq!((b.cast::<u8>().addr().get() - base) % 64, 0);
        assert_eq!(b.cast::<u8>().addr().get() % 64, 0);

        // The block is 64 bytes, so it can only be freed with the same layout.
        assert_eq!(
            unsafe { buddy.deallocate(b.cast(), 4, 4) },
            Err(DeallocError::NotAllocated)
        );
        unsafe { buddy.deallocate(b.cast(), 4, 64).unwrap() };
    }

    #[test]
    fn contract_violations_are_reported() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();

        let small = buddy.allocate(4, 4).unwrap();
        let big = buddy.allocate(32, 4).unwrap();
        let free_before = buddy.free_bytes();

        let mut outside = 0u32;
        let outside = NonNull::from(&mut outside).cast::<u8>();

        unsafe {
            assert_eq!(
                buddy.deallocate(outside, 4, 4),
                Err(DeallocError::NotOwned)
            );
            assert_eq!(
                buddy.deallocate(small.cast(), 0, 4),
                Err(DeallocError::InvalidLayout)
            );
            assert_eq!(
                buddy.deallocate(small.cast(), 4, 5),
                Err(DeallocError::InvalidLayout)
            );
            assert_eq!(
                buddy.deallocate(small.cast(), 256, 4),
                Err(DeallocError::InvalidLayout)
            );

            // `small` is at offset 0; one byte in is not the start of a block.
            let inside = NonNull::new_unchecked(small.cast::<u8>().as_ptr().add(1));
            assert_eq!(buddy.deallocate(inside, 4, 4), Err(DeallocError::Misaligned));

            // Freeing `big` with a smaller size finds an order-0 node inside an
            // allocated block.
            assert_eq!(
                buddy.deallocate(big.cast(), 4, 4),
                Err(DeallocError::NotAllocated)
            );

            // Freeing `small` with a larger size finds the split node above it.
            assert_eq!(
                buddy.deallocate(small.cast(), 8, 4),
                Err(DeallocError::SizeMismatch)
            );

            // Nothing was changed by the rejected calls.
            assert_eq!(buddy.free_bytes(), free_before);

            buddy.deallocate(small.cast(), 4, 4).unwrap();
            assert_eq!(
                buddy.deallocate(small.cast(), 4, 4),
                Err(DeallocError::NotAllocated),
                "double free went undetected"
            );

            buddy.deallocate(big.cast(), 32, 4).unwrap();
        }

        assert!(buddy.is_idle());
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn trait_deallocate_panics_on_violation() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();
        let block = Allocator::allocate(&mut buddy, 4, 4).unwrap();

        unsafe {
            Allocator::deallocate(&mut buddy, block.cast(), 4, 4);
            Allocator::deallocate(&mut buddy, block.cast(), 4, 4);
        }
    }

    #[test]
    fn upstream_called_once_each_way() {
        let mut counter = CountingAllocator::new(Global);

        {
            let mut buddy = BuddyAllocator::<1024, 8, _>::try_new_in(&mut counter).unwrap();
            assert_eq!(buddy.upstream().alloc_count(), 1);

            let blocks: Vec<_> = (0..16).map(|_| buddy.allocate(64, 8).unwrap()).collect();
            for b in blocks {
                unsafe { buddy.deallocate(b.cast(), 64, 8).unwrap() };
            }

            assert_eq!(buddy.upstream().alloc_count(), 1);
            assert_eq!(buddy.upstream().dealloc_count(), 0);
        }

        assert_eq!(counter.alloc_count(), 1);
        assert_eq!(counter.dealloc_count(), 1);
    }

    #[test]
    fn leaked_allocations_still_release_arena() {
        let mut counter = CountingAllocator::new(Global);

        {
            let mut buddy = BuddyAllocator::<256, 16, _>::try_new_in(&mut counter).unwrap();
            let _leaked = buddy.allocate(16, 16).unwrap();
            assert!(!buddy.is_idle());
        }

        assert_eq!(counter.dealloc_count(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "free bytes")]
    fn debug_assert_idle_catches_leak() {
        let mut buddy = BuddyAllocator::<256, 16, Global>::new();
        let _leaked = buddy.allocate(16, 16).unwrap();
        buddy.debug_assert_idle();
    }

    struct FailingAllocator;

    impl Allocator for FailingAllocator {
        fn allocate(&mut self, _: usize, _: usize) -> Result<NonNull<[u8]>, AllocError> {
            Err(AllocError)
        }

        unsafe fn deallocate(&mut self, _: NonNull<u8>, _: usize, _: usize) {
            unreachable!("nothing was allocated");
        }
    }

    #[test]
    fn upstream_failure_propagates() {
        let err = BuddyAllocator::<1024, 8, _>::try_new_in(FailingAllocator).unwrap_err();

        match err {
            AllocInitError::AllocFailed(layout) => {
                assert!(layout.size() >= 1024);
                assert_eq!(layout.align(), 1024);
            }
            other => unreachable!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn oversized_config_never_calls_upstream() {
        let mut counter = CountingAllocator::new(Global);

        // More leaves than a free list link can index.
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            BuddyAllocator::<{ 1 << 40 }, 4, _>::try_new_in(&mut counter).unwrap_err(),
            AllocInitError::InvalidConfig,
        );

        // Arena plus metadata overflows `isize::MAX`.
        assert_eq!(
            BuddyAllocator::<{ 1 << (usize::BITS - 1) }, { 1 << (usize::BITS - 8) }, _>::try_new_in(
                &mut counter
            )
            .unwrap_err(),
            AllocInitError::InvalidConfig,
        );

        assert_eq!(counter.alloc_count(), 0);
        assert_eq!(counter.dealloc_count(), 0);
    }

    /// Hands out blocks at the very top of the address space.
    struct TopOfMemory;

    impl Allocator for TopOfMemory {
        fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
            let ptr = NonNull::new(sptr::invalid_mut::<u8>(usize::MAX & !(align - 1)))
                .ok_or(AllocError)?;
            Ok(NonNull::slice_from_raw_parts(ptr, size))
        }

        unsafe fn deallocate(&mut self, _: NonNull<u8>, _: usize, _: usize) {}
    }

    #[test]
    fn arena_past_end_of_memory_is_returned() {
        let mut counter = CountingAllocator::new(TopOfMemory);

        assert_eq!(
            BuddyAllocator::<128, 4, _>::try_new_in(&mut counter).unwrap_err(),
            AllocInitError::InvalidConfig,
        );

        assert_eq!(counter.alloc_count(), 1);
        assert_eq!(counter.dealloc_count(), 1);
    }

    #[test]
    fn owns_is_exact_arena_bounds() {
        let mut buddy = BuddyAllocator::<128, 4, Global>::new();
        let base = buddy.base.ptr();
        let at = |ofs: usize| unsafe { NonNull::new_unchecked(base.as_ptr().add(ofs)) };

        assert!(buddy.owns(base));
        assert!(buddy.owns(at(64)));
        assert!(buddy.owns(at(127)));
        assert!(!buddy.owns(at(128)));

        let below = NonNull::new(base.as_ptr().wrapping_sub(1)).unwrap();
        assert!(!buddy.owns(below));

        let b = buddy.allocate(4, 4).unwrap();
        let free = buddy.free_bytes();

        assert_eq!(
            unsafe { buddy.deallocate(at(128), 4, 4) },
            Err(DeallocError::NotOwned)
        );
        assert_eq!(
            unsafe { buddy.deallocate(below, 4, 4) },
            Err(DeallocError::NotOwned)
        );
        assert_eq!(buddy.free_bytes(), free);

        unsafe { buddy.deallocate(b.cast(), 4, 4).unwrap() };
        assert!(buddy.is_idle());
    }

    #[test]
    fn whole_arena_at_full_alignment() {
        let mut buddy = BuddyAllocator::<8192, 16, Global>::new();
        assert_eq!(buddy.max_align(), 8192);

        let b = buddy.allocate(8192, 8192).unwrap();
        assert_eq!(b.len(), 8192);
        assert_eq!(b.cast::<u8>().addr().get() % 8192, 0);
        assert_eq!(buddy.free_bytes(), 0);
        assert_eq!(buddy.allocate(8192, 16384), Err(AllocError));

        unsafe { buddy.deallocate(b.cast(), 8192, 8192).unwrap() };

        // Any block size may request the arena's full alignment.
        let small = buddy.allocate(16, 4096).unwrap();
        assert_eq!(small.len(), 16);
        assert_eq!(small.cast::<u8>().addr().get() % 4096, 0);
        unsafe { buddy.deallocate(small.cast(), 16, 4096).unwrap() };

        assert!(buddy.is_idle());
    }

    #[test]
    fn dyn_upstream() {
        let mut global = Global;
        let upstream: &mut dyn Allocator = &mut global;

        let mut buddy = BuddyAllocator::<512, 8, _>::try_new_in(upstream).unwrap();
        let b = buddy.allocate(24, 8).unwrap();
        unsafe { buddy.deallocate(b.cast(), 24, 8).unwrap() };

        let boxed: Box<dyn Allocator> = Box::new(Global);
        let mut buddy = BuddyAllocator::<512, 8, _>::try_new_in(boxed).unwrap();
        let b = buddy.allocate(24, 8).unwrap();
        unsafe { buddy.deallocate(b.cast(), 24, 8).unwrap() };
    }

    #[test]
    fn nested_buddy_allocators() {
        let mut outer = BuddyAllocator::<65536, 64, Global>::new();

        {
            let mut inner = BuddyAllocator::<1024, 8, _>::try_new_in(&mut outer).unwrap();
            let b = inner.allocate(100, 4).unwrap();
            unsafe { mark(b, 0xdead_beef) };
            assert_eq!(unsafe { read_mark(b) }, 0xdead_beef);
            unsafe { inner.deallocate(b.cast(), 100, 4).unwrap() };
        }

        assert!(outer.is_idle());
    }
}
