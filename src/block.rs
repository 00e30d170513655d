//! Boundary-tag block layout.
//!
//! A block is addressed by its payload pointer. One 32-bit word directly
//! below the payload holds `size | allocated_bit`; the same word is repeated
//! in the last-but-one word of the block (the footer), so the physical block
//! chain can be walked in both directions:
//!
//! ```text
//! payload - 4          payload              payload + size - 8
//!      |                  |                        |
//!      v                  v                        v
//!      +--------+---------------------------------+--------+
//!      | header |             payload             | footer |
//!      +--------+---------------------------------+--------+
//!      '------------------- size bytes --------------------'
//! ```
//!
//! While a block is free, the first two pointer-sized payload words are
//! overlaid with the `pred`/`succ` links of the size-class list that holds
//! it. Those links belong to the list; they are dead the instant the block
//! is allocated or split.

use core::{mem, ptr::NonNull};

/// The alignment unit. Every payload pointer handed out by the allocator is
/// aligned to this boundary and every block size is a multiple of it.
pub const ALIGNMENT: usize = 8;

/// Size of a header or footer word.
pub(crate) const WORD: usize = mem::size_of::<u32>();

/// Bytes consumed by a block's header and footer together.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// The minimum total block size: header, footer and the two free-list links
/// that overlay the payload while the block is free.
pub const MIN_BLOCK_SIZE: usize = OVERHEAD + 2 * mem::size_of::<usize>();

const ALLOC_BIT: u32 = 1;
const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

/// A view of one physical block, addressed by its payload pointer.
///
/// Accessors are pure address arithmetic around that pointer. The ones that
/// dereference are `unsafe` and trust the caller (ultimately the allocator
/// core, which knows the managed range) to hand them pointers inside the
/// heap; alignment is `debug_assert!`ed at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    #[inline]
    pub fn from_payload(payload: NonNull<u8>) -> Self {
        debug_assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
        Self(payload)
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Address of the header word.
    #[inline]
    fn header(self) -> *mut u32 {
        self.0.as_ptr().wrapping_sub(WORD).cast()
    }

    /// Address of the footer word. Valid only while the header holds the
    /// block's current size.
    #[inline]
    pub unsafe fn footer(self) -> *mut u32 {
        self.0.as_ptr().add(self.size() - OVERHEAD).cast()
    }

    /// Total block size in bytes, decoded from the header.
    #[inline]
    pub unsafe fn size(self) -> usize {
        (self.header().read() & SIZE_MASK) as usize
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        self.header().read() & ALLOC_BIT != 0
    }

    #[inline]
    pub unsafe fn header_word(self) -> u32 {
        self.header().read()
    }

    #[inline]
    pub unsafe fn footer_word(self) -> u32 {
        self.footer().read()
    }

    /// Writes only the header word. The epilogue sentinel has no footer.
    #[inline]
    pub unsafe fn set_header(self, size: usize, allocated: bool) {
        self.header().write(size as u32 | allocated as u32);
    }

    /// Encodes `size | allocated` into both boundary tags. The footer
    /// position follows from the new size, so this also works when a merge
    /// just grew the block.
    #[inline]
    pub unsafe fn set(self, size: usize, allocated: bool) {
        debug_assert_eq!(size % ALIGNMENT, 0);
        self.set_header(size, allocated);
        self.footer().write(size as u32 | allocated as u32);
    }

    /// The physically following block (the epilogue, at the top of the
    /// heap).
    #[inline]
    pub unsafe fn next_phys(self) -> Block {
        Block(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// The physically preceding block, found through its footer, which sits
    /// in the word directly below this block's header. The prologue
    /// sentinel guarantees that word exists for every real block.
    #[inline]
    pub unsafe fn prev_phys(self) -> Block {
        let prev_size = (self.0.as_ptr().sub(OVERHEAD).cast::<u32>().read() & SIZE_MASK) as usize;
        Block(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size)))
    }

    /// Predecessor link of a free block.
    #[inline]
    pub unsafe fn pred(self) -> Option<Block> {
        NonNull::new(self.0.as_ptr().cast::<*mut u8>().read()).map(Block)
    }

    /// Successor link of a free block.
    #[inline]
    pub unsafe fn succ(self) -> Option<Block> {
        NonNull::new(self.0.as_ptr().cast::<*mut u8>().add(1).read()).map(Block)
    }

    #[inline]
    pub unsafe fn set_pred(self, pred: Option<Block>) {
        self.0.as_ptr().cast::<*mut u8>().write(opt_ptr(pred));
    }

    #[inline]
    pub unsafe fn set_succ(self, succ: Option<Block>) {
        self.0.as_ptr().cast::<*mut u8>().add(1).write(opt_ptr(succ));
    }
}

#[inline]
fn opt_ptr(block: Option<Block>) -> *mut u8 {
    block.map_or(core::ptr::null_mut(), |block| block.0.as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Arena([u8; 256]);

    #[test]
    fn tags_and_neighbors() {
        let mut arena = Arena([0; 256]);
        unsafe {
            let base = arena.0.as_mut_ptr();
            let a = Block::from_payload(NonNull::new_unchecked(base.add(8)));
            a.set(40, true);
            assert_eq!(a.size(), 40);
            assert!(a.is_allocated());
            assert_eq!(a.header_word(), a.footer_word());

            let b = a.next_phys();
            assert_eq!(b.addr(), a.addr() + 40);
            b.set(MIN_BLOCK_SIZE, false);
            assert!(!b.is_allocated());
            assert_eq!(b.prev_phys(), a);

            b.set_pred(None);
            b.set_succ(Some(a));
            assert_eq!(b.pred(), None);
            assert_eq!(b.succ(), Some(a));
        }
    }
}
