//! Per-order free lists of buddy blocks.
//!
//! Free blocks are identified by the index of their first minimum-size block
//! (their "leaf"). No two free blocks share a leaf, so one link slot per leaf
//! is enough to thread every free block of every order into a doubly linked
//! list. The link slots live in allocator metadata rather than in the blocks
//! themselves, which keeps the arena untouched and lets blocks be smaller than
//! a pair of links.
//!
//! Links are stored as `u32` leaf indices, so an allocator may have at most
//! [`MAX_LEAVES`] minimum-size blocks.

use core::{
    alloc::{Layout, LayoutError},
    mem,
};

/// The greatest number of block orders an allocator can have.
pub const MAX_ORDERS: usize = usize::BITS as usize;

const NIL: u32 = u32::MAX;

/// The greatest number of leaves a set of free lists can index.
pub const MAX_LEAVES: usize = NIL as usize;

/// A link in a free list, stored in the slot of the block's leaf.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct FreeLink {
    prev: u32,
    next: u32,
}

/// One LIFO doubly linked list of free blocks per order.
pub struct FreeLists {
    heads: [u32; MAX_ORDERS],
    lens: [usize; MAX_ORDERS],
    num_leaves: usize,
    links: *mut FreeLink,
}

impl FreeLists {
    /// Returns the layout of the link storage required for `num_leaves`
    /// minimum-size blocks.
    pub fn links_layout(num_leaves: usize) -> Result<Layout, LayoutError> {
        Layout::array::<FreeLink>(num_leaves)
    }

    /// Constructs an empty set of free lists over `num_leaves` link slots.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `links` must be valid for reads and writes for
    ///   `FreeLists::links_layout(num_leaves).size()` bytes, and it must be
    ///   properly aligned.
    /// - `links` must not be accessed other than through the returned value
    ///   for as long as it exists.
    pub unsafe fn new(num_leaves: usize, links: *mut FreeLink) -> FreeLists {
        assert!(num_leaves > 0 && num_leaves <= MAX_LEAVES);
        assert!(!links.is_null());
        assert!(links.align_offset(mem::align_of::<FreeLink>()) == 0);

        for i in 0..num_leaves {
            unsafe { links.add(i).write(FreeLink { prev: NIL, next: NIL }) };
        }

        FreeLists {
            heads: [NIL; MAX_ORDERS],
            lens: [0; MAX_ORDERS],
            num_leaves,
            links,
        }
    }

    /// Converts `leaf` to its stored form.
    #[inline]
    fn index(&self, leaf: usize) -> u32 {
        assert!(leaf < self.num_leaves);

        // Cannot truncate: `num_leaves <= MAX_LEAVES`.
        leaf as u32
    }

    #[inline]
    fn link(&self, leaf: u32) -> FreeLink {
        let leaf = leaf as usize;
        assert!(leaf < self.num_leaves);

        // SAFETY: in bounds, checked above.
        unsafe { self.links.add(leaf).read() }
    }

    #[inline]
    fn link_mut(&mut self, leaf: u32) -> &mut FreeLink {
        let leaf = leaf as usize;
        assert!(leaf < self.num_leaves);

        // SAFETY: in bounds, checked above. `self` is mutably borrowed, so no
        // other reference to the slot exists.
        unsafe { &mut *self.links.add(leaf) }
    }

    /// Returns `true` if the free list for `order` is empty.
    #[inline]
    pub fn is_empty(&self, order: usize) -> bool {
        self.heads[order] == NIL
    }

    /// Returns the number of free blocks of `order`.
    #[inline]
    pub fn len(&self, order: usize) -> usize {
        self.lens[order]
    }

    /// Pushes the block starting at `leaf` onto the head of the list for
    /// `order`.
    pub fn push(&mut self, order: usize, leaf: usize) {
        let leaf = self.index(leaf);
        let old_head = self.heads[order];

        if old_head != NIL {
            self.link_mut(old_head).prev = leaf;
        }

        *self.link_mut(leaf) = FreeLink {
            prev: NIL,
            next: old_head,
        };

        self.heads[order] = leaf;
        self.lens[order] += 1;
    }

    /// Pops the most recently pushed block from the list for `order`.
    pub fn pop(&mut self, order: usize) -> Option<usize> {
        let head = self.heads[order];
        if head == NIL {
            return None;
        }

        let head = head as usize;
        self.remove(order, head);

        Some(head)
    }

    /// Unlinks the block starting at `leaf` from the list for `order`.
    ///
    /// The block must be an element of that list.
    pub fn remove(&mut self, order: usize, leaf: usize) {
        let leaf = self.index(leaf);
        let FreeLink { prev, next } = self.link(leaf);

        match prev {
            // `leaf` is the head of the list.
            NIL => {
                debug_assert_eq!(self.heads[order], leaf, "block not in free list");
                self.heads[order] = next;
            }

            // Link `prev` forward to `next`.
            p => self.link_mut(p).next = next,
        }

        if next != NIL {
            // Link `next` back to `prev`.
            self.link_mut(next).prev = prev;
        }

        *self.link_mut(leaf) = FreeLink {
            prev: NIL,
            next: NIL,
        };

        self.lens[order] -= 1;
    }

    /// Returns an iterator over the leaves of the blocks in the list for
    /// `order`, from most to least recently pushed.
    #[cfg(test)]
    pub fn iter(&self, order: usize) -> Iter<'_> {
        Iter {
            lists: self,
            cur: self.heads[order],
        }
    }
}

#[cfg(test)]
pub struct Iter<'a> {
    lists: &'a FreeLists,
    cur: u32,
}

#[cfg(test)]
impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }

        let leaf = self.cur;
        self.cur = self.lists.link(leaf).next;

        Some(leaf as usize)
    }
}
