// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Anonymous virtual-memory mappings for pool allocators.
//!
//! This crate provides the [`MemorySource`] trait, the interface through which pool allocators
//! acquire and release page-granular regions of memory, and [`MmapSource`], its operating
//! system-backed implementation. On Linux and Mac, `MmapSource` uses `mmap` to create anonymous,
//! private, read/write mappings; on Windows, it uses `VirtualAlloc` to reserve and commit
//! read/write pages.
//!
//! A `MemorySource` is deliberately narrower than a general-purpose allocator: mappings are
//! always zero-filled, always readable and writable, and are released whole. Callers that need
//! finer-grained control over permissions or commit behavior should talk to the operating system
//! directly.

// TODO:
// - Support all Unices, not just Linux and Mac

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("mem-source only supports Windows, Linux, and Mac");


use std::ptr;
use std::ptr::NonNull;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use errno::errno;

/// A provider of page-granular memory regions.
///
/// A `MemorySource` hands out regions of virtual memory and takes them back. Regions are
/// zero-filled, readable, and writable, and their addresses are aligned to the system page size.
///
/// # Safety
///
/// Implementors must guarantee that a region returned from `map` is valid for reads and writes of
/// `size` bytes, is not aliased by any other live region, and remains valid until it is passed to
/// `unmap`.
pub unsafe trait MemorySource {
    /// Acquires a region of at least `size` bytes.
    ///
    /// Returns `None` if the source cannot currently provide the memory. `map` treats memory
    /// exhaustion as a recoverable condition; any other failure to map is a panic.
    fn map(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a region previously returned from `map`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned from a call to `map` on this source with the same `size`,
    /// and must not have already been unmapped. The caller must ensure that no outstanding
    /// references into the region exist.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize);
}

/// A `MemorySource` backed by the operating system's virtual memory subsystem.
///
/// The name reflects the Unix implementation; on Windows, mappings come from `VirtualAlloc`
/// instead. Mappings are anonymous, private, and read/write on every platform.
///
/// `MmapSource` is a stateless handle. Copies of it are interchangeable, and a region mapped
/// through one copy may be unmapped through another.
#[derive(Copy, Clone, Debug, Default)]
pub struct MmapSource;

unsafe impl MemorySource for MmapSource {
    fn map(&self, size: usize) -> Option<NonNull<u8>> {
        unsafe { map(size) }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        unmap(ptr.as_ptr(), size);
    }
}

#[cfg(target_os = "linux")]
unsafe fn map(size: usize) -> Option<NonNull<u8>> {
    use libc::{ENOMEM, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_ANONYMOUS | MAP_PRIVATE,
        -1,
        0,
    );

    if ptr == MAP_FAILED {
        if errno().0 == ENOMEM {
            None
        } else {
            panic!("mmap failed: {}", errno())
        }
    } else {
        // On Linux, if the MAP_FIXED flag is not supplied, mmap will never return NULL. From the
        // Linux manpage: "The portable way to create a mapping is to specify addr as 0 (NULL), and
        // omit MAP_FIXED from flags. In this case, the system chooses the address for the mapping;
        // the address is chosen so as not to conflict with any existing mapping, and will not be
        // 0."
        assert_ne!(ptr, ptr::null_mut(), "mmap returned NULL");
        NonNull::new(ptr as *mut u8)
    }
}

#[cfg(target_os = "macos")]
unsafe fn map(size: usize) -> Option<NonNull<u8>> {
    use libc::{ENOMEM, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_ANON | MAP_PRIVATE,
        -1,
        0,
    );

    if ptr == MAP_FAILED {
        if errno().0 == ENOMEM {
            None
        } else {
            panic!("mmap failed: {}", errno())
        }
    } else {
        // POSIX-compliant mmap implementations cannot return NULL if the MAP_FIXED flag is not
        // supplied. From the POSIX standard
        // (http://pubs.opengroup.org/onlinepubs/009695399/functions/mmap.html): "When the
        // implementation selects a value for pa, it never places a mapping at address 0, nor does
        // it replace any extant mapping."
        assert_ne!(ptr, ptr::null_mut(), "mmap returned NULL");
        NonNull::new(ptr as *mut u8)
    }
}

#[cfg(windows)]
unsafe fn map(size: usize) -> Option<NonNull<u8>> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    // Reserve and commit in one call; pool segments are written immediately after mapping, so
    // there is nothing to gain from committing lazily.
    let ptr = VirtualAlloc(
        ptr::null_mut(),
        size,
        MEM_RESERVE | MEM_COMMIT,
        PAGE_READWRITE,
    );
    // NOTE: Windows can return many different error codes in different scenarios that all relate
    // to being out of memory. Instead of trying to list them all, we assume that any error is an
    // out-of-memory condition. This is fine so long as our code doesn't have a bug (that would,
    // e.g., result in VirtualAlloc being called with invalid arguments). This isn't ideal, but
    // during debugging, error codes can be printed here, so it's not the end of the world.
    NonNull::new(ptr as *mut u8)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
unsafe fn unmap(ptr: *mut u8, size: usize) {
    // NOTE: Don't inline the call to munmap; then errno might be called before munmap.
    let ret = libc::munmap(ptr as *mut _, size);
    assert_eq!(ret, 0, "munmap failed: {}", errno());
}

#[cfg(windows)]
unsafe fn unmap(ptr: *mut u8, _size: usize) {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    // NOTE: VirtualFree, when unmapping memory (as opposed to decommitting it), can only operate
    // on an entire region previously mapped with VirtualAlloc. As a result, 'ptr' must have been
    // previously returned by VirtualAlloc, and no length is needed since it is known by the kernel
    // (VirtualFree /requires/ that if the third argument is MEM_RELEASE, the second is 0).
    let ret = VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    assert_ne!(
        ret,
        0,
        "Call to VirtualFree failed with error code {}.",
        GetLastError()
    );
}
