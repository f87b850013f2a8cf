// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Segments, chunk geometry, and the segment registry.
//!
//! A *segment* is one mapping acquired from the pool's `MemorySource`, carved into
//! fixed-stride chunks. Where the segment's own descriptor lives depends on the pool's size
//! class:
//!
//! - Ordinary class (object size below an eighth of a page): the mapping is two pages,
//!   every byte of it is chunk storage, and the descriptor is heap-allocated outside the
//!   mapping. Small objects are the common case, and spending mapping bytes on a descriptor
//!   would cost a slot.
//! - Large class (object size at least an eighth of a page): the mapping is sized to hold
//!   the descriptor followed by exactly [`LARGE_CLASS_SLOTS`] chunks, rounded up to a page.
//!   The descriptor sits at the base of the mapping and dies with it.

use std::mem;
use std::ptr;
use std::ptr::NonNull;

use log::trace;
use mem_source::MemorySource;

use crate::chunk::{self, ChunkHeader};
use crate::PAGE_SIZE;

/// The alignment of every chunk data region. Objects with stricter alignment cannot be
/// pooled.
pub const CHUNK_ALIGN: usize = 16;

/// Chunk slots carved into every large-class segment.
pub const LARGE_CLASS_SLOTS: usize = 24;

/// Ordinary-class mappings are this many pages.
// TODO: Let callers pick the ordinary-class mapping size (fixed at two pages today).
const ORDINARY_CLASS_PAGES: usize = 2;

pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// A segment descriptor.
///
/// `live` counts chunks from this segment currently held by callers; a segment with
/// `live == 0` may be unmapped. `prev`/`next` thread the descriptor into its pool's
/// [`SegmentList`].
#[repr(C)]
pub struct Segment {
    pub base: *mut u8,
    pub map_size: usize,
    pub live: usize,
    pub prev: *mut Segment,
    pub next: *mut Segment,
}

impl Segment {
    fn new(base: *mut u8, map_size: usize) -> Segment {
        Segment {
            base,
            map_size,
            live: 0,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Writes a chunk header into every slot of `seg`'s mapping and links them in address
    /// order. Returns the head and tail of the run. This is the only place chunk headers
    /// are initialized.
    pub unsafe fn carve(seg: *mut Segment, geo: &Geometry) -> (NonNull<ChunkHeader>, NonNull<ChunkHeader>) {
        let base = (*seg).base;
        let head = base.add(geo.first_chunk_offset) as *mut ChunkHeader;
        let mut prev: *mut ChunkHeader = ptr::null_mut();
        let mut cur = head;
        for _ in 0..geo.slots {
            debug_assert_eq!(cur as usize % CHUNK_ALIGN, 0);
            ptr::write(
                cur,
                ChunkHeader {
                    next: ptr::null_mut(),
                    owner: seg,
                },
            );
            if geo.canary {
                ChunkHeader::stamp_canary(cur, chunk::CANARY_FREE);
            }
            if !prev.is_null() {
                (*prev).next = cur;
            }
            prev = cur;
            cur = (cur as *mut u8).add(geo.stride) as *mut ChunkHeader;
        }
        (NonNull::new_unchecked(head), NonNull::new_unchecked(prev))
    }
}

/// Which descriptor-placement regime a pool's objects fall into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SizeClass {
    Ordinary,
    Large,
}

/// Precomputed chunk and mapping geometry for one object layout.
///
/// Every distance the pool ever needs is derived once, at construction: the stride between
/// chunk slots, the size of each mapping, how many slots a mapping yields, and where the
/// first slot begins. Segments of one pool all share this geometry.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    pub object_size: usize,
    pub canary: bool,
    /// Distance from a chunk header to its data region.
    pub header_size: usize,
    /// Distance between consecutive chunk headers.
    pub stride: usize,
    pub class: SizeClass,
    pub map_size: usize,
    /// Chunk slots carved out of each segment.
    pub slots: usize,
    /// Offset of the first chunk header within a mapping.
    pub first_chunk_offset: usize,
}

impl Geometry {
    /// Derives the geometry for objects of the given size and alignment.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, or if `align` is not a power of two, or if `align` exceeds
    /// [`CHUNK_ALIGN`].
    pub fn for_object(size: usize, align: usize, canary: bool) -> Geometry {
        assert!(size > 0, "cannot pool zero-size objects");
        assert!(
            align.is_power_of_two(),
            "object alignment ({}) is not a power of two",
            align
        );
        assert!(
            align <= CHUNK_ALIGN,
            "object alignment ({}) is not supported; chunks are aligned to {}",
            align,
            CHUNK_ALIGN
        );

        let pagesize = *PAGE_SIZE;
        let header_size = if canary {
            chunk::HEADER_SIZE_CANARY
        } else {
            chunk::HEADER_SIZE
        };
        let stride = align_up(size, CHUNK_ALIGN) + header_size;

        let (class, map_size, slots, first_chunk_offset) = if size >= pagesize / 8 {
            let descriptor = align_up(mem::size_of::<Segment>(), CHUNK_ALIGN);
            let map_size = align_up(descriptor + LARGE_CLASS_SLOTS * stride, pagesize);
            (SizeClass::Large, map_size, LARGE_CLASS_SLOTS, descriptor)
        } else {
            let map_size = ORDINARY_CLASS_PAGES * pagesize;
            (SizeClass::Ordinary, map_size, map_size / stride, 0)
        };

        // the slots and the descriptor fit within the mapping
        debug_assert!(slots > 0);
        debug_assert!(first_chunk_offset + slots * stride <= map_size);

        Geometry {
            object_size: size,
            canary,
            header_size,
            stride,
            class,
            map_size,
            slots,
            first_chunk_offset,
        }
    }
}

/// Maps a fresh segment from `source` and writes its descriptor, but does not carve it.
///
/// Returns `None` when the source declines the mapping; nothing is left behind in that
/// case.
pub fn create<S: MemorySource>(source: &S, geo: &Geometry) -> Option<*mut Segment> {
    let base = source.map(geo.map_size)?.as_ptr();
    let seg = match geo.class {
        SizeClass::Large => {
            let seg = base as *mut Segment;
            unsafe { ptr::write(seg, Segment::new(base, geo.map_size)) };
            seg
        }
        SizeClass::Ordinary => Box::into_raw(Box::new(Segment::new(base, geo.map_size))),
    };
    trace!(
        "mapped segment: base {:p}, {} bytes, {} slots",
        base,
        geo.map_size,
        geo.slots
    );
    Some(seg)
}

/// Releases an empty segment's descriptor and mapping.
///
/// # Safety
///
/// `seg` must have come from `create` with the same `source` and `geo`, must no longer be
/// in any list or registry, and none of its chunks may be live or on the free list.
pub unsafe fn destroy<S: MemorySource>(source: &S, geo: &Geometry, seg: *mut Segment) {
    debug_assert!((*seg).is_empty());
    let base = (*seg).base;
    let map_size = (*seg).map_size;
    match geo.class {
        // The descriptor is inside the mapping and goes down with it.
        SizeClass::Large => {}
        SizeClass::Ordinary => drop(Box::from_raw(seg)),
    }
    trace!("unmapping segment: base {:p}, {} bytes", base, map_size);
    source.unmap(NonNull::new_unchecked(base), map_size);
}

/// The registry of a pool's segments.
///
/// An intrusive doubly linked list threaded through `Segment::prev`/`next`. Segments are
/// appended in mapping order; removal is O(1) from any position, which is what eager
/// reclamation needs.
pub struct SegmentList {
    head: *mut Segment,
    tail: *mut Segment,
    len: usize,
}

impl SegmentList {
    pub fn new() -> SegmentList {
        SegmentList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The first segment, or null when the registry is empty. Traversal is through
    /// `Segment::next`.
    pub fn head(&self) -> *mut Segment {
        self.head
    }

    pub fn push_back(&mut self, seg: *mut Segment) {
        unsafe {
            debug_assert!((*seg).prev.is_null());
            debug_assert!((*seg).next.is_null());
            if self.tail.is_null() {
                debug_assert!(self.head.is_null());
                self.head = seg;
            } else {
                (*self.tail).next = seg;
                (*seg).prev = self.tail;
            }
            self.tail = seg;
            self.len += 1;
        }
    }

    pub fn remove(&mut self, seg: *mut Segment) {
        unsafe {
            if (*seg).prev.is_null() {
                debug_assert_eq!(self.head, seg);
                self.head = (*seg).next;
            } else {
                (*(*seg).prev).next = (*seg).next;
            }
            if (*seg).next.is_null() {
                debug_assert_eq!(self.tail, seg);
                self.tail = (*seg).prev;
            } else {
                (*(*seg).next).prev = (*seg).prev;
            }
            (*seg).prev = ptr::null_mut();
            (*seg).next = ptr::null_mut();
            self.len -= 1;
        }
    }
}
