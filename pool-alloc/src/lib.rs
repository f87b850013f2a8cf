// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size object pools backed by virtual-memory segments.
//!
//! # Design
//!
//! A pool serves objects of a single size and alignment. Memory is acquired from a
//! [`MemorySource`] in page-granular *segments*; each segment is carved into fixed-stride
//! *chunks*, and every chunk is a small header followed by the caller-visible data region.
//! Chunks not currently handed out circulate through a single pool-wide free list, so
//! allocation is a list pop and deallocation is a list push, both O(1) and both performed
//! under the pool's mutex.
//!
//! Two descriptor-placement regimes keep per-object overhead low across the size spectrum.
//! Objects smaller than an eighth of a page get two-page segments that are pure chunk
//! storage, with segment descriptors allocated outside the mapping. Larger objects get
//! segments sized for a fixed number of chunks, with the descriptor stored inline at the
//! base of the mapping.
//!
//! Behavior that slab allocators traditionally fix at compile time is configured per pool
//! through [`PoolBuilder`]:
//!
//! * [`InsertionPolicy`] picks where freed chunks re-enter the free list: at the head, so
//!   the next allocation reuses cache-warm memory, or at the tail, cycling evenly through
//!   all chunks.
//! * [`ReclamationPolicy`] picks when an empty segment's mapping is returned to the source:
//!   eagerly on the free that empties it, or deferred until an explicit [`RawPool::purge`].
//! * Canary stamping places a sentinel word in each chunk header and verifies it on every
//!   allocate and free, turning header scribbles and double frees into immediate panics
//!   instead of silent corruption.
//!
//! [`Pool`] is the typed front end; [`RawPool`] serves untyped blocks and does all the
//! work. Neither constructs nor drops objects in the memory it hands out.

mod chunk;
mod segment;
#[cfg(test)]
mod tests;

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use lazy_static::lazy_static;
use log::{debug, trace};

pub use mem_source::{MemorySource, MmapSource};

use crate::chunk::{ChunkHeader, FreeList, CANARY_FREE, CANARY_LIVE};
use crate::segment::{Geometry, Segment, SegmentList};

lazy_static! {
    static ref PAGE_SIZE: usize = sysconf::page::pagesize();
}

/// Returned by `allocate` when the free list is empty and the memory source declines to
/// provide a new segment.
///
/// The failed call leaves the pool unchanged; allocation may be retried once memory is
/// freed or the source recovers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "memory source exhausted")
    }
}

impl std::error::Error for OutOfMemory {}

/// Where freed chunks re-enter the free list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertionPolicy {
    /// Freed chunks go to the head of the list, so the next allocation returns the most
    /// recently freed (and likely cache-warm) chunk.
    WarmHead,
    /// Freed chunks go to the tail of the list, so allocations cycle through every chunk
    /// evenly.
    FifoTail,
}

/// When an empty segment's mapping is returned to the memory source.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReclamationPolicy {
    /// A segment is unmapped by the `free` call that returns its last live chunk.
    Eager,
    /// Empty segments stay mapped until [`RawPool::purge`] is called.
    Deferred,
}

/// A builder for pools.
///
/// A `PoolBuilder` represents the configuration of a pool: the insertion policy, the
/// reclamation policy, and whether chunk headers carry a canary word. New builders are
/// constructed with `default`, which selects head insertion, eager reclamation, and no
/// canary.
pub struct PoolBuilder {
    insertion: InsertionPolicy,
    reclamation: ReclamationPolicy,
    canary: bool,
}

impl Default for PoolBuilder {
    fn default() -> PoolBuilder {
        PoolBuilder {
            insertion: InsertionPolicy::WarmHead,
            reclamation: ReclamationPolicy::Eager,
            canary: false,
        }
    }
}

impl PoolBuilder {
    /// Updates where freed chunks re-enter the free list.
    pub fn insertion_policy(mut self, policy: InsertionPolicy) -> PoolBuilder {
        self.insertion = policy;
        self
    }

    /// Updates when empty segments are returned to the memory source.
    pub fn reclamation_policy(mut self, policy: ReclamationPolicy) -> PoolBuilder {
        self.reclamation = policy;
        self
    }

    /// Enables or disables canary stamping.
    ///
    /// With canaries enabled, each chunk header carries a sentinel word that is written on
    /// every ownership transfer and verified on every allocate and free. Corruption of the
    /// word, including the one caused by freeing a chunk twice, panics before the pool's
    /// state is touched. The canary widens every chunk header by 16 bytes.
    pub fn canary(mut self, enabled: bool) -> PoolBuilder {
        self.canary = enabled;
        self
    }

    /// Builds a pool for objects of type `T`, backed by the operating system.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or requires alignment greater than 16.
    pub fn build<T>(self) -> Pool<T, MmapSource> {
        self.build_with_source(MmapSource)
    }

    /// Builds a pool for objects of type `T` with a custom memory source.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or requires alignment greater than 16.
    pub fn build_with_source<T, S: MemorySource>(self, source: S) -> Pool<T, S> {
        Pool {
            raw: self.build_untyped_with_source(mem::size_of::<T>(), mem::align_of::<T>(), source),
            _marker: PhantomData,
        }
    }

    /// Builds an untyped pool for blocks of the given size and alignment, backed by the
    /// operating system.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, or if `align` is not a power of two, or if `align` is
    /// greater than 16.
    pub fn build_untyped(self, size: usize, align: usize) -> RawPool<MmapSource> {
        self.build_untyped_with_source(size, align, MmapSource)
    }

    /// Builds an untyped pool with a custom memory source.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, or if `align` is not a power of two, or if `align` is
    /// greater than 16.
    pub fn build_untyped_with_source<S: MemorySource>(
        self,
        size: usize,
        align: usize,
        source: S,
    ) -> RawPool<S> {
        let geo = Geometry::for_object(size, align, self.canary);
        debug!(
            "new pool: object size {}, stride {}, {:?} segments of {} slots, {:?}/{:?}",
            geo.object_size, geo.stride, geo.class, geo.slots, self.insertion, self.reclamation
        );
        RawPool {
            core: Mutex::new(PoolCore {
                freelist: FreeList::new(),
                segments: SegmentList::new(),
                live: 0,
                capacity: 0,
            }),
            geo,
            insertion: self.insertion,
            reclamation: self.reclamation,
            source,
        }
    }
}

/// A typed fixed-size pool.
///
/// `Pool<T>` hands out uninitialized, uniquely owned `T`-sized blocks. It never constructs
/// or drops `T`s itself; callers write objects into allocated memory and are responsible
/// for dropping them in place before freeing.
pub struct Pool<T, S: MemorySource = MmapSource> {
    raw: RawPool<S>,
    _marker: PhantomData<T>,
}

/// An untyped fixed-size pool.
///
/// All blocks served by one `RawPool` share a size and alignment, fixed at construction.
/// Operations take `&self`; the pool's state is guarded by an internal mutex, so a pool
/// shared between threads serializes its callers.
pub struct RawPool<S: MemorySource = MmapSource> {
    core: Mutex<PoolCore>,
    geo: Geometry,
    insertion: InsertionPolicy,
    reclamation: ReclamationPolicy,
    source: S,
}

// The raw pointers in PoolCore never escape the critical section unguarded; chunks and
// segments are reached only through the mutex.
unsafe impl<S: MemorySource + Send> Send for RawPool<S> {}
unsafe impl<S: MemorySource + Sync> Sync for RawPool<S> {}

struct PoolCore {
    freelist: FreeList,
    segments: SegmentList,
    /// Chunks currently held by callers, across all segments.
    live: usize,
    /// Chunk slots across all mapped segments.
    capacity: usize,
}

impl<T, S: MemorySource> Pool<T, S> {
    /// Allocates an uninitialized block sized and aligned for `T`.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized; the caller must not read it before writing a
    /// valid `T`, and must not use it after passing it to [`free`](Pool::free).
    pub unsafe fn allocate(&self) -> Result<NonNull<T>, OutOfMemory> {
        self.raw.allocate().map(NonNull::cast)
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](Pool::allocate) on this pool and must not
    /// have already been freed. If `T` needs dropping, the caller must have dropped the
    /// object in place first.
    pub unsafe fn free(&self, ptr: NonNull<T>) {
        self.raw.free(ptr.cast());
    }

    /// Unmaps every empty segment. See [`RawPool::purge`].
    pub fn purge(&self) {
        self.raw.purge();
    }

    /// Objects currently held by callers.
    pub fn live_objects(&self) -> usize {
        self.raw.live_objects()
    }

    /// Chunk slots across all mapped segments.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Segments currently mapped.
    pub fn segment_count(&self) -> usize {
        self.raw.segment_count()
    }

    /// Chunks waiting in the free list.
    pub fn free_chunks(&self) -> usize {
        self.raw.free_chunks()
    }
}

impl<S: MemorySource> RawPool<S> {
    // Canary checks run before any state they guard is mutated, so the core behind a
    // poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, PoolCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates one uninitialized block.
    ///
    /// Pops the head of the free list, expanding the pool by one segment first if the list
    /// is empty. Fails only if expansion was needed and the memory source declined it; the
    /// failed call leaves the pool unchanged.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized; the caller must not read it before writing to
    /// it, and must not use it after passing it to [`free`](RawPool::free).
    pub unsafe fn allocate(&self) -> Result<NonNull<u8>, OutOfMemory> {
        let mut core = self.lock();
        while core.freelist.is_empty() {
            self.expand(&mut core)?;
        }

        let chunk = core.freelist.peek_head();
        if self.geo.canary {
            ChunkHeader::check_canary(chunk, CANARY_FREE, "allocate");
        }
        let popped = core.freelist.pop_head();
        debug_assert_eq!(popped, chunk);
        if self.geo.canary {
            ChunkHeader::stamp_canary(chunk, CANARY_LIVE);
        }
        (*(*chunk).owner).live += 1;
        core.live += 1;
        Ok(NonNull::new_unchecked(ChunkHeader::data(
            chunk,
            self.geo.header_size,
        )))
    }

    /// Returns a block to the pool.
    ///
    /// The chunk re-enters the free list at the position chosen by the pool's
    /// [`InsertionPolicy`]. Under [`ReclamationPolicy::Eager`], a free that empties its
    /// segment also unmaps it.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](RawPool::allocate) on this pool and must not
    /// have already been freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let chunk = ChunkHeader::from_data(ptr.as_ptr(), self.geo.header_size);
        let mut core = self.lock();
        if self.geo.canary {
            ChunkHeader::check_canary(chunk, CANARY_LIVE, "free");
            ChunkHeader::stamp_canary(chunk, CANARY_FREE);
        }
        debug_assert!((*chunk).next.is_null());
        match self.insertion {
            InsertionPolicy::WarmHead => core.freelist.push_head(chunk),
            InsertionPolicy::FifoTail => core.freelist.push_tail(chunk),
        }
        let seg = (*chunk).owner;
        (*seg).live -= 1;
        core.live -= 1;
        if self.reclamation == ReclamationPolicy::Eager && (*seg).is_empty() {
            self.release_segment(&mut core, seg);
        }
    }

    /// Unmaps every empty segment.
    ///
    /// Walks the segment registry once; each segment with no live chunks has its chunks
    /// removed from the free list and its mapping returned to the source. Purging is
    /// idempotent, and a no-op under [`ReclamationPolicy::Eager`] since empty segments
    /// never outlive the free that emptied them.
    pub fn purge(&self) {
        let mut core = self.lock();
        let mut seg = core.segments.head();
        while !seg.is_null() {
            unsafe {
                // the segment may be unmapped below; step first
                let next = (*seg).next;
                if (*seg).is_empty() {
                    self.release_segment(&mut core, seg);
                }
                seg = next;
            }
        }
    }

    /// Objects currently held by callers.
    pub fn live_objects(&self) -> usize {
        self.lock().live
    }

    /// Chunk slots across all mapped segments.
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Segments currently mapped.
    pub fn segment_count(&self) -> usize {
        self.lock().segments.len()
    }

    /// Chunks waiting in the free list.
    pub fn free_chunks(&self) -> usize {
        self.lock().freelist.len()
    }

    /// Maps one segment, carves it, and installs its chunks as the free list.
    ///
    /// Mapping is the only fallible step and happens first, so a failed expansion leaves
    /// the pool untouched.
    fn expand(&self, core: &mut PoolCore) -> Result<(), OutOfMemory> {
        let seg = match segment::create(&self.source, &self.geo) {
            Some(seg) => seg,
            None => return Err(OutOfMemory),
        };
        unsafe {
            let (head, tail) = Segment::carve(seg, &self.geo);
            core.freelist.install_run(head, tail, self.geo.slots);
        }
        core.segments.push_back(seg);
        core.capacity += self.geo.slots;
        trace!(
            "pool expanded: {} slots, {} segments, capacity {}",
            self.geo.slots,
            core.segments.len(),
            core.capacity
        );
        Ok(())
    }

    /// Removes an empty segment: its chunks leave the free list, its descriptor leaves the
    /// registry, and its mapping goes back to the source.
    fn release_segment(&self, core: &mut PoolCore, seg: *mut Segment) {
        unsafe {
            debug_assert!((*seg).is_empty());
            let removed = core.freelist.purge_segment(seg);
            // an empty segment has every one of its chunks in the free list
            debug_assert_eq!(removed, self.geo.slots);
            core.segments.remove(seg);
            core.capacity -= self.geo.slots;
            segment::destroy(&self.source, &self.geo, seg);
        }
    }
}

impl<S: MemorySource> Drop for RawPool<S> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if core.live != 0 {
            if thread::panicking() {
                // Already unwinding; leave the mappings to the process rather than pulling
                // them out from under live pointers.
                return;
            }
            panic!("{} live objects remain when dropping pool", core.live);
        }

        // live == 0 means every segment is empty; return them all.
        let mut seg = core.segments.head();
        while !seg.is_null() {
            unsafe {
                let next = (*seg).next;
                segment::destroy(&self.source, &self.geo, seg);
                seg = next;
            }
        }
    }
}
