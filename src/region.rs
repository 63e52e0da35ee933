//! Anonymous memory regions for hosting the heap.
//!
//! The allocator takes an opaque base pointer; it does not care whether
//! the bytes behind it are persistent memory, a DAX mapping, or plain
//! DRAM. [`MappedRegion`] provides the DRAM case: an anonymous private
//! mapping with a transparent-hugepage hint, used by the tests and
//! benchmarks in this repository and by callers simulating NVM.

use std::io;
use std::ptr::NonNull;

/// An anonymous memory mapping, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is plain memory with a stable address for the life
// of the value.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of zeroed anonymous memory.
    ///
    /// On Linux the mapping is hinted for transparent hugepages and
    /// pre-faulted so first-touch latency does not land inside measured
    /// paths.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        #[cfg(target_os = "linux")]
        unsafe {
            let _ = libc::madvise(ptr, len, libc::MADV_HUGEPAGE);
        }

        // Pre-fault so the pages are backed before use.
        unsafe {
            let base = ptr as *mut u8;
            for offset in (0..len).step_by(4096) {
                std::ptr::write_volatile(base.add(offset), 0);
            }
        }

        // Safety: mmap succeeded, so the pointer is non-null.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        Ok(Self { ptr, len })
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        debug_assert_eq!(result, 0, "munmap failed");
    }
}
