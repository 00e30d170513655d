//! Backing memory for [`SegFit`](crate::SegFit).

use core::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crate::block::ALIGNMENT;

/// A growable, contiguous region of backing memory.
///
/// # Safety
///
/// Implementations must uphold all of the following, or the allocator will
/// exhibit undefined behavior:
///
///  - Each successful [`grow`](Self::grow) returns a region that starts
///    exactly where the previous grant ended, so that all grants together
///    form one contiguous range. The first grant must be aligned to
///    [`ALIGNMENT`].
///
///  - The returned length is at least `min_bytes` and a multiple of
///    [`ALIGNMENT`].
///
///  - Granted memory is valid for reads and writes and stays valid (and at
///    the same address) for the lifetime of the implementor.
///
///  - A failed call returns `None` and leaves all previous grants intact.
pub unsafe trait HeapSource {
    /// Extends the region by at least `min_bytes` bytes, returning the
    /// newly granted range, or `None` if the request cannot be satisfied.
    ///
    /// # Safety
    ///
    /// The caller must not hold references to memory the implementor might
    /// remap while growing.
    unsafe fn grow(&mut self, min_bytes: usize) -> Option<NonNull<[u8]>>;
}

/// A [`HeapSource`] doling out a fixed, caller-provided arena.
///
/// Growth requests are served bump-pointer style from the front of the
/// arena until it runs out.
#[derive(Debug)]
pub struct ArenaSource<'arena> {
    cursor: *mut u8,
    end: *mut u8,
    _marker: PhantomData<&'arena mut [MaybeUninit<u8>]>,
}

// The raw pointers refer to the exclusively borrowed arena.
unsafe impl Send for ArenaSource<'_> {}

impl<'arena> ArenaSource<'arena> {
    /// Creates a source backed by `arena`. Both ends of the arena are
    /// trimmed to [`ALIGNMENT`]; an arena too small to contain an aligned
    /// byte ends up with no capacity at all.
    pub fn new(arena: &'arena mut [MaybeUninit<u8>]) -> Self {
        let range = arena.as_mut_ptr_range();
        let start = (range.start as usize).wrapping_add(ALIGNMENT - 1) & !(ALIGNMENT - 1);
        let end = (range.end as usize & !(ALIGNMENT - 1)).max(start);
        Self {
            cursor: start as *mut u8,
            end: end as *mut u8,
            _marker: PhantomData,
        }
    }

    /// The number of bytes not yet granted.
    pub fn remaining(&self) -> usize {
        self.end as usize - self.cursor as usize
    }
}

unsafe impl HeapSource for ArenaSource<'_> {
    unsafe fn grow(&mut self, min_bytes: usize) -> Option<NonNull<[u8]>> {
        let len = min_bytes.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
        if len > self.remaining() {
            return None;
        }

        let start = self.cursor;
        self.cursor = self.cursor.wrapping_add(len);
        NonNull::new(core::ptr::slice_from_raw_parts_mut(start, len))
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::MmapSource;
    }
}
