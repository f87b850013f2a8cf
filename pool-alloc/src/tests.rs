// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::*;
use crate::chunk::{self, ChunkHeader};
use crate::segment::{align_up, Segment, SizeClass, CHUNK_ALIGN, LARGE_CLASS_SLOTS};

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use quickcheck::{Arbitrary, Gen, QuickCheck};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// A 24-byte object; small enough for the ordinary class on any page size.
type Obj = [u64; 3];

// Check that:
// - every segment's live count sums to the pool's live count
// - the registry length matches the segment count implied by capacity
// - every chunk is either live or in the free list
fn assert_conserved<S: MemorySource>(pool: &RawPool<S>) {
    let core = pool.core.lock().unwrap();
    let mut seg_live = 0;
    let mut seg_count = 0;
    unsafe {
        let mut seg = core.segments.head();
        while !seg.is_null() {
            seg_live += (*seg).live;
            seg_count += 1;
            seg = (*seg).next;
        }
    }
    assert_eq!(seg_live, core.live);
    assert_eq!(seg_count, core.segments.len());
    assert_eq!(core.capacity, core.segments.len() * pool.geo.slots);
    assert_eq!(core.live + core.freelist.len(), core.capacity);
}

/// A source that declines all mappings after a configurable number of successes.
struct BoundedSource {
    inner: MmapSource,
    remaining: AtomicUsize,
}

impl BoundedSource {
    fn new(maps: usize) -> BoundedSource {
        BoundedSource {
            inner: MmapSource,
            remaining: AtomicUsize::new(maps),
        }
    }
}

unsafe impl MemorySource for BoundedSource {
    fn map(&self, size: usize) -> Option<NonNull<u8>> {
        let left = self.remaining.load(Ordering::Relaxed);
        if left == 0 {
            return None;
        }
        self.remaining.store(left - 1, Ordering::Relaxed);
        self.inner.map(size)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        self.inner.unmap(ptr, size);
    }
}

#[test]
fn test_round_trip_eager() {
    let pool = PoolBuilder::default().build::<Obj>();
    unsafe {
        let obj = pool.allocate().unwrap();
        obj.as_ptr().write([1, 2, 3]);
        assert_eq!(*obj.as_ptr(), [1, 2, 3]);
        assert_eq!(pool.live_objects(), 1);
        assert_eq!(pool.segment_count(), 1);
        pool.free(obj);
    }
    // the free emptied the only segment, and eager reclamation unmapped it
    assert_eq!(pool.live_objects(), 0);
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.free_chunks(), 0);
}

#[test]
fn test_round_trip_deferred() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let obj = pool.allocate().unwrap();
        assert_eq!(pool.capacity(), slots);
        assert_eq!(pool.free_chunks(), slots - 1);
        pool.free(obj);
    }
    // the segment lingers with every chunk back in the free list
    assert_eq!(pool.live_objects(), 0);
    assert_eq!(pool.segment_count(), 1);
    assert_eq!(pool.free_chunks(), slots);
    assert_conserved(&pool.raw);
    // an alloc/free pair on the warm pool restores it exactly
    unsafe {
        let obj = pool.allocate().unwrap();
        assert_eq!(pool.free_chunks(), slots - 1);
        pool.free(obj);
    }
    assert_eq!(pool.free_chunks(), slots);
    assert_eq!(pool.live_objects(), 0);
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.free_chunks(), 0);
    // purging an already-purged pool is a no-op
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
}

#[test]
fn test_ordinary_class_geometry() {
    let pagesize = *PAGE_SIZE;
    let pool = PoolBuilder::default().build_untyped(24, 8);
    let geo = &pool.geo;
    assert_eq!(geo.class, SizeClass::Ordinary);
    assert_eq!(geo.header_size, chunk::HEADER_SIZE);
    assert_eq!(geo.stride, align_up(24, CHUNK_ALIGN) + chunk::HEADER_SIZE);
    assert_eq!(geo.map_size, 2 * pagesize);
    assert_eq!(geo.slots, geo.map_size / geo.stride);
    assert_eq!(geo.first_chunk_offset, 0);
}

#[test]
fn test_large_class_geometry() {
    let pagesize = *PAGE_SIZE;
    let pool = PoolBuilder::default().build_untyped(pagesize / 2, 16);
    let geo = &pool.geo;
    assert_eq!(geo.class, SizeClass::Large);
    assert_eq!(geo.slots, LARGE_CLASS_SLOTS);
    let descriptor = align_up(mem::size_of::<Segment>(), CHUNK_ALIGN);
    assert_eq!(geo.first_chunk_offset, descriptor);
    assert_eq!(
        geo.map_size,
        align_up(descriptor + LARGE_CLASS_SLOTS * geo.stride, pagesize)
    );
    assert_eq!(geo.map_size % pagesize, 0);
}

#[test]
fn test_size_class_boundary() {
    let pagesize = *PAGE_SIZE;
    // an eighth of a page is the first size that pays for inline descriptors
    let below = PoolBuilder::default().build_untyped(pagesize / 8 - 1, 8);
    assert_eq!(below.geo.class, SizeClass::Ordinary);
    let at = PoolBuilder::default().build_untyped(pagesize / 8, 8);
    assert_eq!(at.geo.class, SizeClass::Large);
    assert_eq!(at.geo.slots, LARGE_CLASS_SLOTS);
}

#[test]
fn test_chunk_alignment_and_stride() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    unsafe {
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.as_ptr() as usize % CHUNK_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % CHUNK_ALIGN, 0);
        // a fresh segment hands out chunks in address order, one stride apart
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            pool.raw.geo.stride
        );
        // full-extent writes land in distinct memory
        a.as_ptr().write([u64::MAX; 3]);
        b.as_ptr().write([0; 3]);
        assert_eq!(*a.as_ptr(), [u64::MAX; 3]);
        assert_eq!(*b.as_ptr(), [0; 3]);
        pool.free(b);
        pool.free(a);
    }
}

#[test]
fn test_ordinary_class_descriptor_is_outside() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    unsafe {
        let block = pool.allocate().unwrap();
        let chunk = ChunkHeader::from_data(block.cast::<u8>().as_ptr(), pool.raw.geo.header_size);
        let seg = (*chunk).owner;
        let base = (*seg).base as usize;
        // the descriptor lives outside its own mapping, and chunk storage starts at the base
        let addr = seg as usize;
        assert!(addr < base || addr >= base + (*seg).map_size);
        assert_eq!(chunk as usize, base);
        pool.free(block);
    }
}

#[test]
fn test_large_class_descriptor_is_inline() {
    let pagesize = *PAGE_SIZE;
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build_untyped(pagesize / 4, 16);
    unsafe {
        let block = pool.allocate().unwrap();
        let chunk = ChunkHeader::from_data(block.as_ptr(), pool.geo.header_size);
        let seg = (*chunk).owner;
        // the descriptor sits at the base of its own mapping, first chunk right after it
        assert_eq!(seg as *mut u8, (*seg).base);
        assert_eq!(
            chunk as usize,
            (*seg).base as usize + pool.geo.first_chunk_offset
        );
        pool.free(block);
    }
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
}

#[test]
fn test_warm_head_reuses_last_freed() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let mut objs: Vec<_> = (0..slots).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.segment_count(), 1);
        let last = *objs.last().unwrap();
        for obj in objs.drain(..) {
            pool.free(obj);
        }
        // head insertion: the most recently freed chunk is handed out first
        let next = pool.allocate().unwrap();
        assert_eq!(next, last);
        pool.free(next);
    }
}

#[test]
fn test_fifo_tail_replays_free_order() {
    let pool = PoolBuilder::default()
        .insertion_policy(InsertionPolicy::FifoTail)
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let objs: Vec<_> = (0..slots).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.free_chunks(), 0);
        for obj in &objs {
            pool.free(*obj);
        }
        // tail insertion: allocations now replay the frees in order
        for expected in &objs {
            let got = pool.allocate().unwrap();
            assert_eq!(got, *expected);
        }
        for obj in objs {
            pool.free(obj);
        }
    }
    pool.purge();
    assert_eq!(pool.capacity(), 0);
}

#[test]
fn test_eager_full_cycle() {
    let _ = env_logger::try_init();
    let pool = PoolBuilder::default().build::<Obj>();
    unsafe {
        let mut objs = Vec::with_capacity(10_000);
        for i in 0..10_000u64 {
            let obj = pool.allocate().unwrap();
            obj.as_ptr().write([i; 3]);
            objs.push(obj);
        }
        assert_eq!(pool.live_objects(), 10_000);
        assert!(pool.capacity() >= 10_000);
        assert_conserved(&pool.raw);
        // freeing in allocation order drains segments one by one; eager reclamation
        // unmaps each as it empties
        for (i, obj) in objs.drain(..).enumerate() {
            assert_eq!(*obj.as_ptr(), [i as u64; 3]);
            pool.free(obj);
        }
    }
    assert_eq!(pool.live_objects(), 0);
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.free_chunks(), 0);
}

#[test]
fn test_deferred_keeps_segment_until_purge() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let objs: Vec<_> = (0..slots).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.segment_count(), 1);
        for obj in objs {
            pool.free(obj);
        }
    }
    assert_eq!(pool.live_objects(), 0);
    assert_eq!(pool.segment_count(), 1);
    assert_eq!(pool.free_chunks(), slots);
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(pool.free_chunks(), 0);
}

#[test]
fn test_purge_spares_live_segments() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        // fill the first segment, then force a second to be mapped
        let first_seg: Vec<_> = (0..slots).map(|_| pool.allocate().unwrap()).collect();
        let extra = pool.allocate().unwrap();
        assert_eq!(pool.segment_count(), 2);
        for obj in first_seg {
            pool.free(obj);
        }
        pool.purge();
        // only the emptied segment went away
        assert_eq!(pool.segment_count(), 1);
        assert_eq!(pool.capacity(), slots);
        assert_eq!(pool.free_chunks(), slots - 1);
        {
            let core = pool.raw.core.lock().unwrap();
            let survivor = core.segments.head();
            let chunk =
                ChunkHeader::from_data(extra.cast::<u8>().as_ptr(), pool.raw.geo.header_size);
            assert_eq!((*chunk).owner, survivor);
            // every remaining free chunk belongs to the surviving segment
            let mut cur = core.freelist.peek_head();
            while !cur.is_null() {
                assert_eq!((*cur).owner, survivor);
                cur = (*cur).next;
            }
        }
        pool.free(extra);
    }
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
}

#[test]
fn test_live_chunks_leave_free_list() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let held: Vec<_> = (0..7).map(|_| pool.allocate().unwrap()).collect();
        let chunks: Vec<_> = held
            .iter()
            .map(|obj| ChunkHeader::from_data(obj.cast::<u8>().as_ptr(), pool.raw.geo.header_size))
            .collect();
        {
            let core = pool.raw.core.lock().unwrap();
            assert_eq!(core.freelist.len(), slots - 7);
            for chunk in &chunks {
                assert!(!core.freelist.contains(*chunk));
                assert!((**chunk).next.is_null());
            }
        }
        for obj in held {
            pool.free(obj);
        }
        let core = pool.raw.core.lock().unwrap();
        assert_eq!(core.freelist.len(), slots);
        for chunk in &chunks {
            assert!(core.freelist.contains(*chunk));
        }
    }
}

#[test]
fn test_failed_expansion_reports_oom() {
    let pool = PoolBuilder::default().build_with_source::<Obj, _>(BoundedSource::new(0));
    unsafe {
        assert_eq!(pool.allocate().unwrap_err(), OutOfMemory);
    }
    assert_eq!(pool.live_objects(), 0);
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.segment_count(), 0);
}

#[test]
fn test_failed_expansion_leaves_pool_intact() {
    let pool = PoolBuilder::default()
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build_with_source::<Obj, _>(BoundedSource::new(1));
    let slots = pool.raw.geo.slots;
    unsafe {
        let mut objs: Vec<_> = (0..slots).map(|_| pool.allocate().unwrap()).collect();
        // the one allowed mapping is spent and the free list is empty
        assert_eq!(pool.allocate().unwrap_err(), OutOfMemory);
        assert_eq!(pool.live_objects(), slots);
        assert_eq!(pool.capacity(), slots);
        assert_eq!(pool.segment_count(), 1);
        assert_eq!(pool.free_chunks(), 0);
        assert_conserved(&pool.raw);
        // freeing lets allocation succeed again without a new mapping
        let freed = objs.pop().unwrap();
        pool.free(freed);
        let again = pool.allocate().unwrap();
        assert_eq!(again, freed);
        pool.free(again);
        for obj in objs {
            pool.free(obj);
        }
    }
    pool.purge();
    assert_eq!(pool.capacity(), 0);
}

#[test]
fn test_canary_accepts_normal_use() {
    let pool = PoolBuilder::default()
        .canary(true)
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    assert_eq!(pool.raw.geo.header_size, chunk::HEADER_SIZE_CANARY);
    unsafe {
        // chunks cycle between free and live repeatedly without tripping the canary
        for i in 0..100u64 {
            let a = pool.allocate().unwrap();
            a.as_ptr().write([i; 3]);
            let b = pool.allocate().unwrap();
            b.as_ptr().write([i + 1; 3]);
            assert_eq!(*a.as_ptr(), [i; 3]);
            pool.free(a);
            pool.free(b);
        }
    }
    pool.purge();
    assert_eq!(pool.capacity(), 0);
}

#[test]
#[should_panic(expected = "canary mismatch")]
fn test_canary_detects_double_free() {
    // deferred reclamation keeps the segment mapped so the second free reads the header
    // rather than unmapped memory
    let pool = PoolBuilder::default()
        .canary(true)
        .reclamation_policy(ReclamationPolicy::Deferred)
        .build::<Obj>();
    unsafe {
        let obj = pool.allocate().unwrap();
        pool.free(obj);
        pool.free(obj);
    }
}

#[test]
#[should_panic(expected = "canary mismatch")]
fn test_canary_detects_header_scribble() {
    let pool = PoolBuilder::default().canary(true).build::<Obj>();
    unsafe {
        let obj = pool.allocate().unwrap();
        // clobber the word 16 bytes before the data region; that's the canary slot
        obj.cast::<u64>().as_ptr().sub(2).write(0);
        pool.free(obj);
    }
}

#[test]
#[should_panic(expected = "live objects remain")]
fn test_drop_with_live_objects_panics() {
    let pool = PoolBuilder::default().build::<Obj>();
    unsafe {
        let _leaked = pool.allocate().unwrap();
    }
    // the pool drops here with one object still out
}

#[test]
#[should_panic(expected = "zero-size")]
fn test_builder_rejects_zero_size() {
    PoolBuilder::default().build_untyped(0, 8);
}

#[test]
#[should_panic(expected = "power of two")]
fn test_builder_rejects_non_power_of_two_align() {
    PoolBuilder::default().build_untyped(24, 3);
}

#[test]
#[should_panic(expected = "not supported")]
fn test_builder_rejects_oversize_align() {
    PoolBuilder::default().build_untyped(24, 32);
}

#[test]
fn test_shuffled_free_order() {
    let _ = env_logger::try_init();
    let pool = PoolBuilder::default().build::<Obj>();
    let slots = pool.raw.geo.slots;
    unsafe {
        let mut objs: Vec<_> = (0..3 * slots + 7)
            .map(|i| {
                let obj = pool.allocate().unwrap();
                obj.as_ptr().write([i as u64; 3]);
                (obj, i as u64)
            })
            .collect();
        objs.shuffle(&mut thread_rng());
        for (n, (obj, tag)) in objs.drain(..).enumerate() {
            assert_eq!(*obj.as_ptr(), [tag; 3]);
            pool.free(obj);
            if n % 64 == 0 {
                assert_conserved(&pool.raw);
            }
        }
    }
    assert_eq!(pool.live_objects(), 0);
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
    assert_eq!(pool.capacity(), 0);
}

#[test]
fn test_shared_across_threads() {
    let pool = Arc::new(PoolBuilder::default().build::<Obj>());
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || unsafe {
            for i in 0..256u64 {
                let batch: Vec<_> = (0..4u64)
                    .map(|j| {
                        let obj = pool.allocate().unwrap();
                        obj.as_ptr().write([t, i, j]);
                        (obj, j)
                    })
                    .collect();
                for (obj, j) in batch {
                    assert_eq!(*obj.as_ptr(), [t, i, j]);
                    pool.free(obj);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.live_objects(), 0);
    pool.purge();
    assert_eq!(pool.segment_count(), 0);
}

#[derive(Copy, Clone, Debug)]
enum PoolOp {
    Alloc,
    Free(usize),
}

impl Arbitrary for PoolOp {
    fn arbitrary(g: &mut Gen) -> PoolOp {
        if bool::arbitrary(g) {
            PoolOp::Alloc
        } else {
            PoolOp::Free(usize::arbitrary(g))
        }
    }
}

// Run an arbitrary alloc/free sequence under an arbitrary configuration, holding every
// live object in a model vector. Each object carries a unique tag that must survive until
// its free, and the pool's counters must stay conserved after every operation.
fn check_op_sequence(ops: Vec<PoolOp>, warm: bool, eager: bool, canary: bool) -> bool {
    let pool = PoolBuilder::default()
        .insertion_policy(if warm {
            InsertionPolicy::WarmHead
        } else {
            InsertionPolicy::FifoTail
        })
        .reclamation_policy(if eager {
            ReclamationPolicy::Eager
        } else {
            ReclamationPolicy::Deferred
        })
        .canary(canary)
        .build::<Obj>();

    let mut held: Vec<(NonNull<Obj>, u64)> = Vec::new();
    let mut counter = 0u64;
    for op in ops {
        match op {
            PoolOp::Alloc => unsafe {
                let obj = pool.allocate().unwrap();
                counter += 1;
                obj.as_ptr().write([counter; 3]);
                held.push((obj, counter));
            },
            PoolOp::Free(idx) if !held.is_empty() => unsafe {
                let (obj, tag) = held.swap_remove(idx % held.len());
                assert_eq!(*obj.as_ptr(), [tag; 3]);
                pool.free(obj);
            },
            PoolOp::Free(_) => {}
        }
        assert_conserved(&pool.raw);
    }
    unsafe {
        for (obj, tag) in held.drain(..) {
            assert_eq!(*obj.as_ptr(), [tag; 3]);
            pool.free(obj);
        }
    }
    pool.purge();
    pool.live_objects() == 0 && pool.segment_count() == 0
}

#[test]
fn quickcheck_op_sequences() {
    let _ = env_logger::try_init();
    QuickCheck::new()
        .tests(50)
        .quickcheck(check_op_sequence as fn(Vec<PoolOp>, bool, bool, bool) -> bool);
}
