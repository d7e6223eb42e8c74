//! OS-level region mappings.
//!
//! Regions are anonymous, private, read-write mappings obtained straight
//! from the operating system. On unix targets this goes through `mmap`;
//! elsewhere it falls back to the global allocator with page alignment.

use std::io;
use std::ptr::NonNull;

/// Maps `len` bytes of anonymous, private, read-write memory.
///
/// Callers round `len` up to [`crate::PAGE_SIZE`] before mapping.
pub(crate) fn map_region(len: usize) -> io::Result<NonNull<u8>> {
    #[cfg(unix)]
    {
        use std::ptr;

        // SAFETY: A fresh anonymous mapping with no address hint; the
        // kernel picks the placement and the fd/offset pair is unused.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "mmap returned null"))
        }
    }

    #[cfg(not(unix))]
    {
        let layout = std::alloc::Layout::from_size_align(len, crate::PAGE_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: `len` is non-zero (callers reject zero-sized pools) and
        // the layout was validated above.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))
    }
}

/// Releases a mapping previously produced by [`map_region`].
///
/// # Safety
/// `ptr` and `len` must describe exactly one prior `map_region` result, and
/// no block inside the range may be used afterwards.
pub(crate) unsafe fn unmap_region(ptr: NonNull<u8>, len: usize) {
    #[cfg(unix)]
    {
        // SAFETY: Caller guarantees this is a live mapping of `len` bytes.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) };
        if rc != 0 {
            tracing::warn!(len, error = %io::Error::last_os_error(), "munmap failed");
        }
    }

    #[cfg(not(unix))]
    {
        match std::alloc::Layout::from_size_align(len, crate::PAGE_SIZE) {
            // SAFETY: Caller guarantees this is a live allocation of `len`
            // bytes with the same layout it was mapped with.
            Ok(layout) => unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) },
            Err(_) => tracing::warn!(len, "refusing to release region with impossible layout"),
        }
    }
}
