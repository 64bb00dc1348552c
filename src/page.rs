//! Page-granular memory straight from the operating system.

use core::{
    ffi::c_void,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::error;

#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;
use crate::{align_up, AllocError, Allocator};

/// Used when the page size cannot be queried.
const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the size of a virtual memory page.
///
/// The page size is queried from the operating system on first use and cached
/// thereafter.
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = query_page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }

        size => size,
    }
}

fn query_page_size() -> usize {
    // SAFETY: `sysconf` has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    match usize::try_from(raw) {
        Ok(size) if size.is_power_of_two() => size,
        _ => {
            error!("sysconf(_SC_PAGESIZE) returned {raw}; assuming {FALLBACK_PAGE_SIZE}");
            FALLBACK_PAGE_SIZE
        }
    }
}

unsafe fn map_anonymous(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: an anonymous private mapping at a kernel-chosen address does not
    // alias any existing memory.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if raw == libc::MAP_FAILED {
        error!("mmap of {len} bytes failed");
        return None;
    }

    NonNull::new(raw.cast::<u8>())
}

unsafe fn unmap(ptr: *mut u8, len: usize) {
    // SAFETY: upheld by the caller.
    let ret = unsafe { libc::munmap(ptr.cast::<c_void>(), len) };

    if ret != 0 {
        error!("munmap of {len} bytes at {ptr:p} failed");
    }
}

/// An allocator which maps whole pages from the operating system.
///
/// Every allocation is a separate anonymous mapping, rounded up to a multiple
/// of [`page_size()`]. Allocations are at least page-aligned; greater
/// alignments are honored by over-mapping and trimming the excess.
///
/// This is intended as the upstream allocator of a [`BuddyAllocator`], which
/// requests its arena once and releases it once.
///
/// [`BuddyAllocator`]: crate::BuddyAllocator
#[derive(Copy, Clone, Debug, Default)]
pub struct PageProvider;

impl PageProvider {
    /// Constructs a new `PageProvider`.
    #[inline]
    pub const fn new() -> PageProvider {
        PageProvider
    }
}

impl Allocator for PageProvider {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(AllocError);
        }

        let page = page_size();
        let len = align_up(size, page).ok_or(AllocError)?;

        if align <= page {
            let ptr = unsafe { map_anonymous(len) }.ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(ptr, size));
        }

        // Map enough to contain an aligned region of `len` bytes, then return
        // the pages on either side of it.
        let total = len.checked_add(align).ok_or(AllocError)?;
        let raw = unsafe { map_anonymous(total) }.ok_or(AllocError)?;

        let raw_addr = raw.addr().get();
        let head = align_up(raw_addr, align).ok_or(AllocError)? - raw_addr;
        let tail = total - head - len;

        // SAFETY: `head + len + tail == total`, so all offsets are within the
        // mapping. `head` and `tail` are multiples of the page size because
        // `raw`, `len` and `align` are.
        let aligned = unsafe {
            let aligned = raw.as_ptr().add(head);

            if head > 0 {
                unmap(raw.as_ptr(), head);
            }

            if tail > 0 {
                unmap(aligned.add(len), tail);
            }

            NonNull::new_unchecked(aligned)
        };

        Ok(NonNull::slice_from_raw_parts(aligned, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) {
        let page = page_size();

        match align_up(size, page) {
            // SAFETY: the caller guarantees that `ptr` was returned by
            // `allocate` with this size, so the mapping is exactly `len` bytes.
            Some(len) => unsafe { unmap(ptr.as_ptr(), len) },
            None => error!("cannot unmap {size} bytes at {:p}", ptr.as_ptr()),
        }
    }
}
