//! Platform glue for the heap region's backing memory.
//!
//! The allocator manages one contiguous region that only ever grows at the
//! high end, so the whole reservation is requested from the kernel in a
//! single call and then parceled out by [`crate::region::Region`] in
//! sbrk-sized slices. Nothing goes back to the kernel until the region
//! itself is dropped.

use std::ptr::NonNull;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The region, our top level view of this, has nothing to do
/// with the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the
    /// kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);
}

/// Marker for the platform the crate was compiled for. The matching
/// [`PlatformMemory`] impl lives in the `cfg`-gated submodules below.
pub(crate) struct Kernel;

/// Wrapper to use [`Kernel::request_memory`]. The returned address is page
/// aligned on every supported platform, which more than satisfies the
/// region's double-word alignment requirement.
#[inline]
pub(crate) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::request_memory(len) }
}

/// Wrapper to use [`Kernel::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(addr: *mut u8, len: usize) {
    unsafe { Kernel::return_memory(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    None
                } else {
                    Some(NonNull::new_unchecked(addr).cast::<u8>())
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Kernel, PlatformMemory};

    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_write_return() {
        unsafe {
            let addr = request_memory(4096).expect("kernel refused 4 KiB");
            assert_eq!(addr.as_ptr() as usize % 8, 0);

            // The pages must actually be ours to write.
            addr.as_ptr().write_bytes(0xAB, 4096);
            assert_eq!(addr.as_ptr().add(4095).read(), 0xAB);

            return_memory(addr.as_ptr(), 4096);
        }
    }
}
