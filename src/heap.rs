//! The allocator core.

use core::ptr::NonNull;

use crate::{
    block::{Block, ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD},
    seglist::FreeListIndex,
    source::HeapSource,
};

mod check;
pub use check::CheckError;

/// The default amount by which the heap is extended when no free block can
/// satisfy a request.
pub const CHUNK_SIZE: usize = 1 << 7;

#[cfg_attr(doc, svgbobdoc::transform)]
/// A segregated-fit heap.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   Size classes                       class k covers sizes up to 24·2^k
///
///            ,------+------+------+-------+------,
///   heads =  |  0   |  1   |  2   |  ...  |  11  |
///            '--+---+------+---+--+-------+------'
///               |              |
///               |              v
///               |        ,-----+-----,      ,-----------,
///               |        | free 96 B +----->| free 72 B |
///               |        '-----------'      '-----------'
///               v
///         ,-----+-----,
///         | free 24 B |
///         '-----------'
///
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Heap region
///
///   ,-----+----------+-------+-------+-------+-------+----------+-----,
///   | PAD | prologue | used  | free  | used  | free  |   used   | EPI |
///   '-----+----------+-------+-------+-------+-------+----------+-----'
///   '------------------- one contiguous, growable range --------------'
/// ```
/// </center>
///
/// # Properties
///
/// Payload pointers are aligned to [`ALIGNMENT`] bytes. The minimum block
/// size is [`MIN_BLOCK_SIZE`] bytes; any smaller request is rounded up to
/// it. The heap is bounded by an allocated prologue block at the bottom and
/// a zero-size allocated epilogue header in the last word, so neighbor
/// lookups never need a range test.
///
/// All state lives in this object; independent heaps can coexist, each
/// backed by its own [`HeapSource`].
#[derive(Debug)]
pub struct SegFit<S: HeapSource> {
    source: S,
    /// Payload pointer of the prologue block.
    first_block: Block,
    /// Lowest address of the managed region.
    heap_start: usize,
    /// One past the highest managed address; the epilogue header occupies
    /// the word directly below.
    heap_end: usize,
    index: FreeListIndex,
    /// When set, every mutating operation ends by running the validator and
    /// logging whatever it finds.
    auto_check: bool,
}

impl<S: HeapSource> SegFit<S> {
    /// Creates a heap on top of `source`.
    ///
    /// The first growth lays down the alignment padding, the prologue
    /// header/footer pair and the epilogue header; whatever the source
    /// grants beyond those four words becomes the initial free block (or is
    /// folded into the prologue when it cannot stand as a block of its
    /// own). Returns `None` if the source cannot satisfy that first growth.
    pub fn new(mut source: S) -> Option<Self> {
        // Padding word, prologue header/footer, epilogue header.
        let grant = unsafe { source.grow(2 * OVERHEAD) }?;
        let start = grant.as_ptr() as *mut u8 as usize;
        let len = grant.len();
        debug_assert_eq!(start % ALIGNMENT, 0);
        debug_assert_eq!(len % ALIGNMENT, 0);

        let first_block =
            unsafe { Block::from_payload(NonNull::new_unchecked((start + OVERHEAD) as *mut u8)) };
        let mut heap = Self {
            source,
            first_block,
            heap_start: start,
            heap_end: start + len,
            index: FreeListIndex::new(),
            auto_check: false,
        };

        unsafe {
            let prologue = heap.first_block;
            let surplus = len - 2 * OVERHEAD;
            if surplus >= MIN_BLOCK_SIZE {
                prologue.set(OVERHEAD, true);
                let free = prologue.next_phys();
                free.set(surplus, false);
                free.next_phys().set_header(0, true);
                heap.index.push_front(free);
            } else {
                prologue.set(OVERHEAD + surplus, true);
                prologue.next_phys().set_header(0, true);
            }
        }

        Some(heap)
    }

    /// Allocates at least `size` usable bytes, returning a pointer aligned
    /// to [`ALIGNMENT`]. A `size` of 0 allocates nothing. Returns `None` on
    /// exhaustion, leaving the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let result = self.allocate_inner(size);
        self.maybe_auto_check();
        result
    }

    fn allocate_inner(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = Self::adjusted_size(size)?;

        unsafe {
            if let Some(block) = self.index.find_fit(asize) {
                return Some(self.place(block, asize));
            }

            let block = self.extend(asize.max(CHUNK_SIZE))?;
            Some(self.place(block, asize))
        }
    }

    /// Returns `ptr`'s block to the free lists, merging it with any free
    /// physical neighbor. A null pointer is a no-op; a pointer outside the
    /// managed region is reported through [`log`] and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, outside the managed region, or a pointer
    /// previously returned by [`Self::allocate`]/[`Self::reallocate`] that
    /// has not been released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        self.release_inner(ptr);
        self.maybe_auto_check();
    }

    unsafe fn release_inner(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if !self.contains(ptr as usize) || ptr as usize % ALIGNMENT != 0 {
            log::warn!("release: ignoring pointer {:p} outside the managed heap", ptr);
            return;
        }

        let block = Block::from_payload(NonNull::new_unchecked(ptr));
        let size = block.size();
        block.set(size, false);
        self.coalesce(block);
    }

    /// Resizes the allocation at `ptr` to `size` bytes by allocating a
    /// fresh block, copying the common prefix and releasing the old block
    /// (copy-always; no in-place growth even when the neighbor is free).
    ///
    /// `size == 0` behaves as [`Self::release`] and returns `None`; a null
    /// `ptr` behaves as [`Self::allocate`]. On exhaustion the old block is
    /// left untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same as [`Self::release`].
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.release(ptr);
            return None;
        }
        if ptr.is_null() {
            return self.allocate(size);
        }
        if !self.contains(ptr as usize) || ptr as usize % ALIGNMENT != 0 {
            log::warn!(
                "reallocate: ignoring pointer {:p} outside the managed heap",
                ptr
            );
            return None;
        }

        let old_usable = Block::from_payload(NonNull::new_unchecked(ptr)).size() - OVERHEAD;

        let new_ptr = self.allocate(size)?;
        core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_usable.min(size));
        self.release(ptr);

        Some(new_ptr)
    }

    /// Allocates a zero-filled buffer of `count * size` bytes.
    ///
    /// The product is computed with wrapping arithmetic and is *not*
    /// checked for overflow; a wrapped product yields a smaller allocation
    /// than the caller asked for.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.wrapping_mul(size);
        let ptr = self.allocate(bytes)?;
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Enables or disables running the validator after every mutating
    /// operation. Failures are logged; no operation is ever failed by the
    /// validator. Off by default.
    pub fn set_auto_check(&mut self, enabled: bool) {
        self.auto_check = enabled;
    }

    /// Returns a mutable reference to the heap source.
    ///
    /// # Safety
    ///
    /// The source must not be driven in a way that breaks the
    /// [`HeapSource`] contract for the range already granted to `self`.
    pub unsafe fn source_mut_unchecked(&mut self) -> &mut S {
        &mut self.source
    }

    fn maybe_auto_check(&self) {
        if self.auto_check {
            if let Err(err) = self.check(false) {
                log::error!("heap check failed: {}", err);
            }
        }
    }

    /// Rounds a request up to a legal block size: payload plus tag overhead,
    /// aligned, and never below the minimum block size.
    fn adjusted_size(size: usize) -> Option<usize> {
        let asize = if size <= 2 * ALIGNMENT {
            MIN_BLOCK_SIZE
        } else {
            size.checked_add(OVERHEAD + ALIGNMENT - 1)? & !(ALIGNMENT - 1)
        };

        // Sizes are stored in 32-bit boundary tags.
        if u32::try_from(asize).is_err() {
            return None;
        }
        Some(asize)
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr > self.heap_start && addr < self.heap_end
    }

    /// Carves `asize` bytes out of the free block `block`, splitting off
    /// the remainder whenever it can stand as a block of its own. Returns
    /// the payload pointer of the allocated block.
    unsafe fn place(&mut self, block: Block, asize: usize) -> NonNull<u8> {
        let free_size = block.size();
        debug_assert!(free_size >= asize);

        self.index.remove(block);

        if free_size - asize >= MIN_BLOCK_SIZE {
            block.set(asize, true);
            let rest = block.next_phys();
            rest.set(free_size - asize, false);
            self.index.push_front(rest);
        } else {
            block.set(free_size, true);
        }

        block.payload()
    }

    /// Grows the heap by at least `min_bytes`. The grant is formatted as
    /// one free block whose header overwrites the old epilogue, a fresh
    /// epilogue is written at the new top, and the block is coalesced with
    /// the old tail if that was free. Returns the resulting free block, or
    /// `None` if the source is exhausted (in which case nothing changed).
    unsafe fn extend(&mut self, min_bytes: usize) -> Option<Block> {
        let grant = self.source.grow(min_bytes)?;
        let start = grant.as_ptr() as *mut u8 as usize;
        let len = grant.len();
        debug_assert_eq!(start, self.heap_end);
        debug_assert_eq!(len % ALIGNMENT, 0);
        debug_assert!(len >= min_bytes);

        self.heap_end = start + len;

        let block = Block::from_payload(NonNull::new_unchecked(start as *mut u8));
        block.set(len, false);
        block.next_phys().set_header(0, true);

        Some(self.coalesce(block))
    }

    /// Merges `block` with whichever physical neighbors are free, pushes
    /// the surviving block onto the class list matching its new size and
    /// returns it. Driven purely by the neighbors' boundary tags, never by
    /// list state; the survivor keeps the lowest address involved.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let prev_free = !block.prev_phys().is_allocated();
        let next_free = !block.next_phys().is_allocated();
        let mut size = block.size();
        let mut survivor = block;

        match (prev_free, next_free) {
            (false, false) => {}
            (false, true) => {
                let next = block.next_phys();
                self.index.remove(next);
                size += next.size();
                block.set(size, false);
            }
            (true, false) => {
                let prev = block.prev_phys();
                self.index.remove(prev);
                size += prev.size();
                survivor = prev;
                survivor.set(size, false);
            }
            (true, true) => {
                let prev = block.prev_phys();
                let next = block.next_phys();
                self.index.remove(prev);
                self.index.remove(next);
                size += prev.size() + next.size();
                survivor = prev;
                survivor.set(size, false);
            }
        }

        self.index.push_front(survivor);
        survivor
    }
}

#[cfg(test)]
mod tests;
