use quickcheck_macros::quickcheck;
use std::{mem::MaybeUninit, prelude::v1::*, ptr::NonNull};

use super::*;
use crate::{
    block::{Block, OVERHEAD},
    source::{ArenaSource, HeapSource},
    ALIGNMENT, MIN_BLOCK_SIZE,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn arena(len: usize) -> Vec<MaybeUninit<u8>> {
    std::vec![MaybeUninit::uninit(); len]
}

fn with_heap(arena_size: usize, f: impl FnOnce(&mut SegFit<ArenaSource<'_>>)) {
    init();
    let mut arena = arena(arena_size);
    let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();
    f(&mut heap);
    heap.check(true).unwrap();
}

/// Records the length of every grant passed through to the inner source.
struct CountingSource<S> {
    inner: S,
    grants: Vec<usize>,
}

unsafe impl<S: HeapSource> HeapSource for CountingSource<S> {
    unsafe fn grow(&mut self, min_bytes: usize) -> Option<NonNull<[u8]>> {
        let grant = self.inner.grow(min_bytes)?;
        self.grants.push(grant.len());
        Some(grant)
    }
}

/// Inflates every growth request by a fixed amount, forcing over-generous
/// grants.
struct PaddedSource<S> {
    inner: S,
    pad: usize,
}

unsafe impl<S: HeapSource> HeapSource for PaddedSource<S> {
    unsafe fn grow(&mut self, min_bytes: usize) -> Option<NonNull<[u8]>> {
        self.inner.grow(min_bytes + self.pad)
    }
}

#[test]
fn minimal() {
    with_heap(1 << 16, |heap| {
        let ptr = heap.allocate(17).unwrap();
        log::trace!("allocate(17) = {:p}", ptr);
        unsafe {
            ptr.as_ptr().write_bytes(0xc3, 17);
            heap.release(ptr.as_ptr());
        }
    });
}

#[test]
fn sweep_alignment_and_capacity() {
    with_heap(1 << 20, |heap| {
        let sizes: Vec<usize> = (1..256)
            .chain([500, 1000, CHUNK_SIZE, CHUNK_SIZE * 3])
            .collect();

        let mut ptrs = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let ptr = heap.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
            unsafe {
                let block = Block::from_payload(ptr);
                assert!(block.size() - OVERHEAD >= size);
                ptr.as_ptr().write_bytes(i as u8, size);
            }
            ptrs.push(ptr);
        }

        heap.check(false).unwrap();

        for (i, (&size, ptr)) in sizes.iter().zip(ptrs).enumerate() {
            unsafe {
                for k in 0..size {
                    assert_eq!(*ptr.as_ptr().add(k), i as u8);
                }
                heap.release(ptr.as_ptr());
            }
        }
    });
}

#[test]
fn small_request_rounds_to_min_block() {
    with_heap(1 << 16, |heap| {
        let ptr = heap.allocate(2 * ALIGNMENT).unwrap();
        unsafe {
            assert_eq!(Block::from_payload(ptr).size(), MIN_BLOCK_SIZE);
            heap.release(ptr.as_ptr());
        }
    });
}

#[test]
fn release_then_allocate_reuses_address() {
    with_heap(1 << 16, |heap| unsafe {
        let p = heap.allocate(100).unwrap();
        heap.release(p.as_ptr());
        assert_eq!(heap.allocate(100).unwrap(), p);
        heap.release(p.as_ptr());

        // A smaller request from a coarser class still lands on the same
        // free block.
        let q = heap.allocate(64).unwrap();
        heap.release(q.as_ptr());
        assert_eq!(heap.allocate(48).unwrap(), q);
        heap.release(q.as_ptr());
    });
}

#[test]
fn first_allocation_grows_by_one_chunk() {
    init();
    let mut arena = arena(1 << 16);
    let source = CountingSource {
        inner: ArenaSource::new(&mut arena),
        grants: Vec::new(),
    };
    let mut heap = SegFit::new(source).unwrap();
    heap.allocate(32).unwrap();

    let grants = unsafe { &heap.source_mut_unchecked().grants };
    assert_eq!(*grants, [2 * OVERHEAD, CHUNK_SIZE]);
    heap.check(false).unwrap();
}

#[test]
fn adjacent_releases_coalesce() {
    with_heap(1 << 16, |heap| unsafe {
        let a = heap.allocate(MIN_BLOCK_SIZE).unwrap();
        let b = heap.allocate(MIN_BLOCK_SIZE).unwrap();
        heap.release(a.as_ptr());
        heap.release(b.as_ptr());

        // The two blocks and the tail of the first chunk merged back into
        // one block spanning the whole chunk.
        assert_eq!(heap.allocate(CHUNK_SIZE - OVERHEAD).unwrap(), a);
        heap.release(a.as_ptr());
    });
}

#[test]
fn reallocate_preserves_prefix() {
    with_heap(1 << 16, |heap| unsafe {
        let p = heap.allocate(50).unwrap();
        for k in 0..50 {
            *p.as_ptr().add(k) = k as u8;
        }

        let q = heap.reallocate(p.as_ptr(), 200).unwrap();
        for k in 0..50 {
            assert_eq!(*q.as_ptr().add(k), k as u8);
        }
        heap.release(q.as_ptr());
    });
}

#[test]
fn reallocate_edge_cases() {
    with_heap(1 << 16, |heap| unsafe {
        // Zero size releases the block.
        let p = heap.allocate(40).unwrap();
        assert_eq!(heap.reallocate(p.as_ptr(), 0), None);
        assert_eq!(heap.allocate(40).unwrap(), p);
        heap.release(p.as_ptr());

        // A null pointer allocates afresh.
        let q = heap.reallocate(core::ptr::null_mut(), 48).unwrap();
        heap.release(q.as_ptr());
    });
}

#[test]
fn out_of_range_release_is_ignored() {
    with_heap(1 << 16, |heap| unsafe {
        let p = heap.allocate(32).unwrap();

        heap.release(core::ptr::null_mut());
        let mut foreign = [0u8; 16];
        heap.release(foreign.as_mut_ptr());

        heap.check(false).unwrap();
        heap.release(p.as_ptr());
    });
}

#[test]
fn allocate_zeroed_fills_with_zero() {
    with_heap(1 << 16, |heap| unsafe {
        // Dirty a block, free it, and make allocate_zeroed reuse it.
        let p = heap.allocate(96).unwrap();
        p.as_ptr().write_bytes(0xaa, 96);
        heap.release(p.as_ptr());

        let q = heap.allocate_zeroed(12, 8).unwrap();
        assert_eq!(q, p);
        for k in 0..96 {
            assert_eq!(*q.as_ptr().add(k), 0);
        }
        heap.release(q.as_ptr());
    });
}

#[test]
fn exhaustion_returns_none_without_corruption() {
    with_heap(512, |heap| unsafe {
        assert_eq!(heap.allocate(1 << 20), None);
        heap.check(false).unwrap();

        // The failed request left the heap usable.
        let p = heap.allocate(64).unwrap();
        heap.release(p.as_ptr());
    });
}

#[test]
fn auto_check_runs_after_each_operation() {
    with_heap(1 << 16, |heap| unsafe {
        heap.set_auto_check(true);
        let p = heap.allocate(100).unwrap();
        let q = heap.reallocate(p.as_ptr(), 30).unwrap();
        heap.release(core::ptr::null_mut());
        heap.release(q.as_ptr());
        heap.set_auto_check(false);
    });
}

#[test]
fn check_reports_tag_mismatch() {
    init();
    let mut arena = arena(1 << 16);
    let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();

    let a = heap.allocate(40).unwrap();
    let _b = heap.allocate(40).unwrap();

    unsafe { Block::from_payload(a).footer().write(0) };
    assert_eq!(
        heap.check(false),
        Err(CheckError::TagMismatch {
            addr: a.as_ptr() as usize
        })
    );
}

#[test]
fn undersized_first_surplus_folds_into_prologue() {
    init();
    let mut arena = arena(1 << 16);
    let source = PaddedSource {
        inner: ArenaSource::new(&mut arena),
        pad: 2 * ALIGNMENT,
    };
    let mut heap = SegFit::new(source).unwrap();
    heap.check(true).unwrap();

    let p = heap.allocate(100).unwrap();
    assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
    heap.check(false).unwrap();
}

#[test]
fn generous_first_grant_forms_initial_free_block() {
    init();
    let mut arena = arena(1 << 16);
    let source = CountingSource {
        inner: PaddedSource {
            inner: ArenaSource::new(&mut arena),
            pad: 1024,
        },
        grants: Vec::new(),
    };
    let mut heap = SegFit::new(source).unwrap();
    heap.check(true).unwrap();

    // The request fits in the first grant's surplus, so no further growth
    // happens.
    heap.allocate(100).unwrap();
    assert_eq!(unsafe { heap.source_mut_unchecked() }.grants.len(), 1);
    heap.check(false).unwrap();
}

#[quickcheck]
fn random(bytecode: Vec<u8>) {
    init();

    struct Alloc {
        ptr: NonNull<u8>,
        len: usize,
        fill: u8,
    }

    let mut arena = arena(1 << 20);
    let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();
    let mut allocs: Vec<Alloc> = Vec::new();

    let mut it = bytecode.into_iter();
    while let Some(op) = it.next() {
        match op % 4 {
            0 | 1 => {
                let (lo, hi, fill) = match (it.next(), it.next(), it.next()) {
                    (Some(lo), Some(hi), Some(fill)) => (lo, hi, fill),
                    _ => break,
                };
                let len = u16::from_le_bytes([lo, hi]) as usize % 2048;
                log::trace!("allocate({})", len);
                if let Some(ptr) = heap.allocate(len) {
                    assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
                    unsafe { ptr.as_ptr().write_bytes(fill, len) };
                    allocs.push(Alloc { ptr, len, fill });
                } else {
                    assert_eq!(len, 0);
                }
            }
            2 => {
                let i = match it.next() {
                    Some(i) => i,
                    None => break,
                };
                if !allocs.is_empty() {
                    let a = allocs.swap_remove(i as usize % allocs.len());
                    log::trace!("release({:p})", a.ptr);
                    unsafe {
                        for k in 0..a.len {
                            assert_eq!(*a.ptr.as_ptr().add(k), a.fill);
                        }
                        heap.release(a.ptr.as_ptr());
                    }
                }
            }
            3 => {
                let (i, lo, hi) = match (it.next(), it.next(), it.next()) {
                    (Some(i), Some(lo), Some(hi)) => (i, lo, hi),
                    _ => break,
                };
                let len = u16::from_le_bytes([lo, hi]) as usize % 2048;
                if !allocs.is_empty() {
                    let i = i as usize % allocs.len();
                    log::trace!("reallocate({:p}, {})", allocs[i].ptr, len);
                    if len == 0 {
                        let a = allocs.swap_remove(i);
                        unsafe {
                            assert!(heap.reallocate(a.ptr.as_ptr(), 0).is_none());
                        }
                    } else {
                        let a = &mut allocs[i];
                        unsafe {
                            for k in 0..a.len {
                                assert_eq!(*a.ptr.as_ptr().add(k), a.fill);
                            }
                            if let Some(new_ptr) = heap.reallocate(a.ptr.as_ptr(), len) {
                                for k in 0..a.len.min(len) {
                                    assert_eq!(*new_ptr.as_ptr().add(k), a.fill);
                                }
                                new_ptr.as_ptr().write_bytes(a.fill, len);
                                a.ptr = new_ptr;
                                a.len = len;
                            }
                        }
                    }
                }
            }
            _ => unreachable!(),
        }

        heap.check(false).unwrap();
    }

    for a in allocs {
        unsafe { heap.release(a.ptr.as_ptr()) };
    }
    heap.check(false).unwrap();
}

#[cfg(unix)]
#[test]
fn mmap_source_end_to_end() {
    init();
    let source = crate::source::MmapSource::new(1 << 20).unwrap();
    let mut heap = SegFit::new(source).unwrap();

    let a = heap.allocate(4000).unwrap();
    unsafe { a.as_ptr().write_bytes(0x5a, 4000) };
    let b = heap.allocate(100_000).unwrap();
    unsafe { b.as_ptr().write_bytes(0xa5, 100_000) };

    unsafe {
        for k in 0..4000 {
            assert_eq!(*a.as_ptr().add(k), 0x5a);
        }
        for k in 0..100_000 {
            assert_eq!(*b.as_ptr().add(k), 0xa5);
        }
        heap.release(a.as_ptr());
        heap.release(b.as_ptr());
    }
    heap.check(true).unwrap();
}
