use core::ptr::NonNull;

use super::HeapSource;
use crate::block::ALIGNMENT;

/// A [`HeapSource`] backed by an anonymous memory mapping.
///
/// The whole capacity is reserved up front with `PROT_NONE`, which pins the
/// address range without committing memory; growth requests commit pages by
/// flipping their protection to read/write. This keeps the region
/// contiguous without ever moving it.
#[derive(Debug)]
pub struct MmapSource {
    base: NonNull<u8>,
    capacity: usize,
    committed: usize,
    page_mask: usize,
}

unsafe impl Send for MmapSource {}

impl MmapSource {
    /// Reserves an address range able to hold up to `capacity` bytes
    /// (rounded up to whole pages). Returns `None` if the reservation
    /// fails.
    pub fn new(capacity: usize) -> Option<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if !page_size.is_power_of_two() || page_size < ALIGNMENT {
            return None;
        }
        let page_mask = page_size - 1;
        let capacity = capacity.checked_add(page_mask)? & !page_mask;
        if capacity == 0 {
            return None;
        }

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                capacity,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }

        Some(Self {
            // `mmap` never returns null without `MAP_FIXED`.
            base: NonNull::new(base as *mut u8)?,
            capacity,
            committed: 0,
            page_mask,
        })
    }

    /// The number of bytes that can still be granted.
    pub fn remaining(&self) -> usize {
        self.capacity - self.committed
    }
}

unsafe impl HeapSource for MmapSource {
    unsafe fn grow(&mut self, min_bytes: usize) -> Option<NonNull<[u8]>> {
        let len = min_bytes.checked_add(self.page_mask)? & !self.page_mask;
        if len > self.remaining() {
            return None;
        }

        let start = self.base.as_ptr().add(self.committed);
        if libc::mprotect(start as *mut _, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            return None;
        }
        self.committed += len;

        NonNull::new(core::ptr::slice_from_raw_parts_mut(start, len))
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut _, self.capacity) };
    }
}
