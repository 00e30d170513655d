//! This crate implements a segregated-fit dynamic memory allocator with
//! boundary tags and immediate coalescing.
//!
//!  - **One contiguous, monotonically growable heap.** The allocator manages
//!    a single address range bounded by prologue/epilogue sentinel blocks and
//!    extends it on demand through a [`HeapSource`] supplied by the
//!    application.
//!
//!  - **Segregated free lists.** Free blocks are partitioned into 12
//!    geometrically sized classes, each an intrusive doubly linked list
//!    threaded through the free blocks' payloads. A request scans the
//!    smallest viable class first-fit and falls through to larger classes,
//!    bounding the search cost.
//!
//!  - **Boundary tags.** Every block carries its size and allocated bit in
//!    both a header and a footer word, so physically adjacent free blocks are
//!    merged the moment one of them is released.
//!
//!  - **This crate supports `#![no_std]`.** The core needs nothing but a
//!    [`HeapSource`]; an arena-backed source works on any target and an
//!    `mmap`-backed one is provided on Unix.
//!
//! # Examples
//!
//! ```rust
//! use segfit::{ArenaSource, SegFit};
//! use std::mem::MaybeUninit;
//!
//! let mut arena = [MaybeUninit::uninit(); 65536];
//! let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 100);
//!     heap.release(ptr.as_ptr());
//! }
//! assert!(heap.check(false).is_ok());
//! ```
//!
//! # Details
//!
//! The allocator is deliberately single-threaded: [`SegFit`] holds raw
//! pointers into the region it owns and is therefore neither [`Send`] nor
//! [`Sync`]. Wrap it yourself if you need sharing.
//!
//! Misuse handling is minimal by design. Null and out-of-range pointers
//! passed to [`SegFit::release`]/[`SegFit::reallocate`] are reported through
//! [`log`] and ignored; double releases and stale in-range pointers are
//! undefined behavior, which is why those operations are `unsafe fn`s. The
//! [`SegFit::check`] validator exists for tests and debugging, not as a
//! safety mechanism.
#![no_std]

mod block;
mod heap;
mod seglist;
mod source;

pub use self::{
    block::{ALIGNMENT, MIN_BLOCK_SIZE},
    heap::{CheckError, SegFit, CHUNK_SIZE},
    source::*,
};

#[cfg(test)]
extern crate std;
