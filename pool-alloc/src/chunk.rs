// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Chunk headers and the pool-wide free list.
//!
//! A *chunk* is one slot of a segment: a header followed by the caller-visible data region.
//! Headers are written in place when a segment is carved and never move. Free chunks are
//! threaded through their `next` fields into a single list per pool; a live chunk is not on
//! the list, and its `next` field is null.

use std::mem;
use std::ptr;
use std::ptr::NonNull;

use crate::segment::Segment;

/// Stamped into the canary slot while a chunk sits in the free list.
pub const CANARY_FREE: u64 = 0xcaca_caca_caca_caca;
/// Stamped into the canary slot while a chunk is held by a caller.
pub const CANARY_LIVE: u64 = 0xa5a5_a5a5_a5a5_a5a5;

/// Header size without a canary slot.
pub const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();
/// Header size with a canary slot. The canary word is followed by a pad word so the data
/// region stays 16-aligned.
pub const HEADER_SIZE_CANARY: usize = HEADER_SIZE + 16;

/// The bookkeeping prefix of every chunk.
///
/// `next` threads the chunk into the pool's free list and is null while the chunk is live.
/// `owner` points at the segment whose mapping contains this chunk and is written once, at
/// carve time.
///
/// When canaries are enabled, a `u64` sentinel sits immediately after this struct (see
/// `HEADER_SIZE_CANARY`); the data region begins at the pool's header size either way.
#[repr(C)]
pub struct ChunkHeader {
    pub next: *mut ChunkHeader,
    pub owner: *mut Segment,
}

impl ChunkHeader {
    /// Pointer to the data region this header fronts.
    pub unsafe fn data(this: *mut ChunkHeader, header_size: usize) -> *mut u8 {
        (this as *mut u8).add(header_size)
    }

    /// Recovers the header from a pointer previously produced by `data`.
    pub unsafe fn from_data(data: *mut u8, header_size: usize) -> *mut ChunkHeader {
        data.sub(header_size) as *mut ChunkHeader
    }

    unsafe fn canary_slot(this: *mut ChunkHeader) -> *mut u64 {
        (this as *mut u8).add(HEADER_SIZE) as *mut u64
    }

    /// Writes `value` into the canary slot. Only meaningful on chunks carved with a canary
    /// header.
    pub unsafe fn stamp_canary(this: *mut ChunkHeader, value: u64) {
        ptr::write(Self::canary_slot(this), value);
    }

    /// Panics unless the canary slot holds `want`.
    ///
    /// A mismatch means the header was scribbled on or the chunk is changing state twice
    /// (e.g. freed while already free). The pool calls this before it mutates any of its
    /// own state, so the panic leaves the pool consistent.
    pub unsafe fn check_canary(this: *mut ChunkHeader, want: u64, op: &str) {
        let got = ptr::read(Self::canary_slot(this));
        if got != want {
            panic!(
                "canary mismatch in {}: chunk {:p} holds {:#018x}, want {:#018x}",
                op, this, got, want
            );
        }
    }
}

/// The pool-wide list of free chunks.
///
/// Singly linked through `ChunkHeader::next`, with head and tail pointers so that both
/// head and tail insertion are O(1). Removal of a whole segment's chunks
/// (`purge_segment`) is the one linear operation.
pub struct FreeList {
    head: *mut ChunkHeader,
    tail: *mut ChunkHeader,
    len: usize,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The head chunk, or null when the list is empty. The chunk stays on the list.
    pub fn peek_head(&self) -> *mut ChunkHeader {
        self.head
    }

    /// Removes and returns the head chunk, or null when the list is empty.
    pub fn pop_head(&mut self) -> *mut ChunkHeader {
        if self.head.is_null() {
            debug_assert!(self.tail.is_null());
            return ptr::null_mut();
        }
        unsafe {
            let chunk = self.head;
            self.head = (*chunk).next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            (*chunk).next = ptr::null_mut();
            self.len -= 1;
            chunk
        }
    }

    /// Inserts `chunk` at the head, making it the next chunk handed out.
    pub fn push_head(&mut self, chunk: *mut ChunkHeader) {
        unsafe {
            debug_assert!(!chunk.is_null());
            debug_assert!((*chunk).next.is_null());
            if self.head.is_null() {
                debug_assert!(self.tail.is_null());
                self.tail = chunk;
            } else {
                (*chunk).next = self.head;
            }
            self.head = chunk;
            self.len += 1;
        }
    }

    /// Inserts `chunk` at the tail, behind every chunk already queued.
    pub fn push_tail(&mut self, chunk: *mut ChunkHeader) {
        unsafe {
            debug_assert!(!chunk.is_null());
            debug_assert!((*chunk).next.is_null());
            if self.tail.is_null() {
                debug_assert!(self.head.is_null());
                self.head = chunk;
            } else {
                (*self.tail).next = chunk;
            }
            self.tail = chunk;
            self.len += 1;
        }
    }

    /// Installs a freshly carved run as the list contents.
    ///
    /// Expansion only happens when the list is empty, so the run never has to be spliced
    /// into existing chunks.
    pub fn install_run(&mut self, head: NonNull<ChunkHeader>, tail: NonNull<ChunkHeader>, len: usize) {
        debug_assert!(self.head.is_null() && self.tail.is_null() && self.len == 0);
        debug_assert!(len > 0);
        self.head = head.as_ptr();
        self.tail = tail.as_ptr();
        self.len = len;
    }

    /// Removes every chunk owned by `seg` in one pass and returns how many were removed.
    ///
    /// Walks the list through a pointer-to-link cursor so removal never loses track of the
    /// predecessor; the tail is recomputed as the last survivor seen.
    pub fn purge_segment(&mut self, seg: *mut Segment) -> usize {
        unsafe {
            let mut link: *mut *mut ChunkHeader = &mut self.head;
            let mut last_kept: *mut ChunkHeader = ptr::null_mut();
            let mut removed = 0;
            while !(*link).is_null() {
                let chunk = *link;
                if (*chunk).owner == seg {
                    *link = (*chunk).next;
                    (*chunk).next = ptr::null_mut();
                    removed += 1;
                } else {
                    last_kept = chunk;
                    link = &mut (*chunk).next;
                }
            }
            self.tail = last_kept;
            self.len -= removed;
            removed
        }
    }

    /// Whether `chunk` is currently threaded into the list. Linear; test support only.
    #[cfg(test)]
    pub fn contains(&self, chunk: *mut ChunkHeader) -> bool {
        unsafe {
            let mut cur = self.head;
            while !cur.is_null() {
                if cur == chunk {
                    return true;
                }
                cur = (*cur).next;
            }
            false
        }
    }
}
