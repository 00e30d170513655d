//! The heap validator.

use core::fmt;

use super::SegFit;
use crate::{
    block::{Block, ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD},
    seglist::{class_of, SIZE_CLASS_COUNT},
    source::HeapSource,
};

/// A consistency violation found by [`SegFit::check`].
///
/// Addresses identify the offending block by its payload pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue block is free, undersized, or clobbered.
    BadPrologue,
    /// The block chain does not end in an allocated zero-size header at the
    /// top of the heap.
    BadEpilogue,
    /// A block's payload is not aligned to [`ALIGNMENT`].
    Misaligned { addr: usize },
    /// A block lies (or extends) outside the managed region.
    OutOfHeap { addr: usize },
    /// A block's header and footer disagree.
    TagMismatch { addr: usize },
    /// A block is smaller than [`MIN_BLOCK_SIZE`].
    Undersized { addr: usize },
    /// Two physically adjacent blocks are both free.
    AdjacentFree { addr: usize },
    /// A block on a free list is marked allocated.
    ListedBlockAllocated { addr: usize },
    /// A block sits on a free list whose class does not match its size.
    WrongClass { addr: usize, class: usize },
    /// A node's predecessor link does not point back at the node that
    /// reached it.
    AsymmetricLinks { addr: usize },
    /// The heap walk and the free-list walk found different numbers of
    /// free blocks.
    FreeCountMismatch { heap_walk: usize, list_walk: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadPrologue => write!(f, "bad prologue block"),
            Self::BadEpilogue => write!(f, "bad epilogue header"),
            Self::Misaligned { addr } => write!(f, "misaligned payload at {:#x}", addr),
            Self::OutOfHeap { addr } => write!(f, "block at {:#x} outside the heap", addr),
            Self::TagMismatch { addr } => {
                write!(f, "header/footer mismatch at {:#x}", addr)
            }
            Self::Undersized { addr } => write!(f, "undersized block at {:#x}", addr),
            Self::AdjacentFree { addr } => {
                write!(f, "uncoalesced free neighbors at {:#x}", addr)
            }
            Self::ListedBlockAllocated { addr } => {
                write!(f, "allocated block at {:#x} on a free list", addr)
            }
            Self::WrongClass { addr, class } => {
                write!(f, "block at {:#x} filed under wrong class {}", addr, class)
            }
            Self::AsymmetricLinks { addr } => {
                write!(f, "asymmetric free-list links at {:#x}", addr)
            }
            Self::FreeCountMismatch { heap_walk, list_walk } => write!(
                f,
                "free block counts disagree (heap walk {}, list walk {})",
                heap_walk, list_walk
            ),
        }
    }
}

impl<S: HeapSource> SegFit<S> {
    /// Walks the whole heap and every free list, reporting each violation
    /// through [`log::error`] and returning the first one found. With
    /// `verbose` set, every block visited is also traced through
    /// [`log::debug`].
    ///
    /// Read-only; safe to call at any point, including on a heap that has
    /// been corrupted by a caller.
    pub fn check(&self, verbose: bool) -> Result<(), CheckError> {
        let mut first: Option<CheckError> = None;
        let mut report = |err: CheckError| {
            log::error!("heap check: {}", err);
            if first.is_none() {
                first = Some(err);
            }
        };

        unsafe {
            // Pass 1: the physical block chain, prologue to epilogue.
            let prologue = self.first_block;
            if !prologue.is_allocated() || prologue.size() < OVERHEAD {
                report(CheckError::BadPrologue);
            }

            let mut heap_free = 0usize;
            let mut reached_epilogue = false;
            let mut block = prologue;
            loop {
                let addr = block.addr();
                if addr % ALIGNMENT != 0 {
                    report(CheckError::Misaligned { addr });
                    break;
                }
                if addr <= self.heap_start || addr > self.heap_end {
                    report(CheckError::OutOfHeap { addr });
                    break;
                }

                let size = block.size();
                if size == 0 {
                    reached_epilogue = true;
                    break;
                }
                if addr + size > self.heap_end {
                    report(CheckError::OutOfHeap { addr });
                    break;
                }

                if verbose {
                    log::debug!(
                        "heap check: block {:#x} size {} {}",
                        addr,
                        size,
                        if block.is_allocated() { "allocated" } else { "free" },
                    );
                }

                if block.header_word() != block.footer_word() {
                    report(CheckError::TagMismatch { addr });
                }
                if size < MIN_BLOCK_SIZE && block != prologue {
                    report(CheckError::Undersized { addr });
                }
                if !block.is_allocated() {
                    heap_free += 1;
                    if !block.next_phys().is_allocated() {
                        report(CheckError::AdjacentFree { addr });
                    }
                }

                block = block.next_phys();
            }

            if !(reached_epilogue && block.is_allocated() && block.addr() == self.heap_end) {
                report(CheckError::BadEpilogue);
            }

            // Pass 2: every free list, checking membership against the tags.
            let mut list_free = 0usize;
            for class in 0..SIZE_CLASS_COUNT {
                let mut prev: Option<Block> = None;
                let mut cursor = self.index.head(class);
                while let Some(node) = cursor {
                    let addr = node.addr();
                    if addr % ALIGNMENT != 0
                        || addr <= self.heap_start
                        || addr >= self.heap_end
                    {
                        report(CheckError::OutOfHeap { addr });
                        break;
                    }
                    if node.is_allocated() {
                        report(CheckError::ListedBlockAllocated { addr });
                    }
                    if class_of(node.size()) != class {
                        report(CheckError::WrongClass { addr, class });
                    }
                    if node.pred() != prev {
                        report(CheckError::AsymmetricLinks { addr });
                    }

                    list_free += 1;
                    prev = Some(node);
                    cursor = node.succ();
                }
            }

            if heap_free != list_free {
                report(CheckError::FreeCountMismatch {
                    heap_walk: heap_free,
                    list_walk: list_free,
                });
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
