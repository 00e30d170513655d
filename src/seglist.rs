//! The segregated free-list index.

use crate::block::{Block, MIN_BLOCK_SIZE};

/// Number of size classes.
pub(crate) const SIZE_CLASS_COUNT: usize = 12;

/// Maps a block size to its size class. Class `k` covers sizes up to
/// `MIN_BLOCK_SIZE << k`; the last class catches everything larger.
/// Monotonic in `size`.
pub(crate) fn class_of(size: usize) -> usize {
    let mut class = 0;
    let mut limit = MIN_BLOCK_SIZE;
    while class + 1 < SIZE_CLASS_COUNT && size > limit {
        class += 1;
        limit <<= 1;
    }
    class
}

/// The class-list heads. Each list is an intrusive doubly linked list
/// threaded through the payloads of the free blocks it holds; list ends are
/// null.
#[derive(Debug)]
pub(crate) struct FreeListIndex {
    heads: [Option<Block>; SIZE_CLASS_COUNT],
}

impl FreeListIndex {
    pub const fn new() -> Self {
        Self {
            heads: [None; SIZE_CLASS_COUNT],
        }
    }

    pub fn head(&self, class: usize) -> Option<Block> {
        self.heads[class]
    }

    /// Inserts `block` at the front of the class list matching its size.
    ///
    /// # Safety
    ///
    /// `block` must be inside the managed region, marked free in its
    /// boundary tags, and not currently on any list.
    pub unsafe fn push_front(&mut self, block: Block) {
        debug_assert!(!block.is_allocated());
        let head = &mut self.heads[class_of(block.size())];

        block.set_pred(None);
        block.set_succ(*head);
        if let Some(old_head) = *head {
            old_head.set_pred(Some(block));
        }
        *head = Some(block);
    }

    /// Unlinks `block` from the class list that holds it, patching its
    /// neighbors or the list head as appropriate.
    ///
    /// # Safety
    ///
    /// `block` must currently be on the list matching its size.
    pub unsafe fn remove(&mut self, block: Block) {
        let head = &mut self.heads[class_of(block.size())];

        match (block.pred(), block.succ()) {
            // sole element
            (None, None) => {
                debug_assert_eq!(*head, Some(block));
                *head = None;
            }
            // head of the list
            (None, Some(succ)) => {
                debug_assert_eq!(*head, Some(block));
                debug_assert!(!succ.is_allocated());
                succ.set_pred(None);
                *head = Some(succ);
            }
            // tail
            (Some(pred), None) => {
                debug_assert!(!pred.is_allocated());
                pred.set_succ(None);
            }
            // interior
            (Some(pred), Some(succ)) => {
                debug_assert!(!pred.is_allocated());
                debug_assert!(!succ.is_allocated());
                pred.set_succ(Some(succ));
                succ.set_pred(Some(pred));
            }
        }
    }

    /// First-fit search starting at the smallest viable class: scans the
    /// class covering `min_size` front to back, then falls through to each
    /// larger class in turn.
    pub unsafe fn find_fit(&self, min_size: usize) -> Option<Block> {
        for head in &self.heads[class_of(min_size)..] {
            let mut cursor = *head;
            while let Some(block) = cursor {
                debug_assert!(!block.is_allocated());
                if block.size() >= min_size {
                    return Some(block);
                }
                cursor = block.succ();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_boundaries() {
        assert_eq!(class_of(MIN_BLOCK_SIZE), 0);
        assert_eq!(class_of(MIN_BLOCK_SIZE + 8), 1);
        assert_eq!(class_of(MIN_BLOCK_SIZE * 2), 1);
        assert_eq!(class_of(MIN_BLOCK_SIZE * 2 + 8), 2);
        assert_eq!(class_of(MIN_BLOCK_SIZE << 10), 10);
        assert_eq!(class_of((MIN_BLOCK_SIZE << 10) + 8), 11);
        assert_eq!(class_of(usize::MAX / 2), 11);
    }

    #[test]
    fn class_of_is_monotonic() {
        let mut last = 0;
        for size in (MIN_BLOCK_SIZE..=MIN_BLOCK_SIZE << 11).step_by(8) {
            let class = class_of(size);
            assert!(class >= last);
            last = class;
        }
    }
}
