use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Default chunk granularity of [`OsChunks`]: 2 MiB.
pub const DEFAULT_LG_CHUNK: u32 = 21;

/// Source of raw, chunk-granularity memory for the base allocator.
///
/// This is the virtual memory layer underneath the base allocator. The
/// base allocator never gives chunks back, so there is no release method.
pub trait ChunkSource {
    /// Chunk size and alignment in bytes. Must be a power of two.
    fn granularity(&self) -> usize;

    /// Requests a chunk of `size` bytes, `size` being a multiple of
    /// [`ChunkSource::granularity`].
    ///
    /// The returned memory must be aligned to the granularity, zero-filled,
    /// readable, writable and exclusively owned by the caller from now on.
    /// `None` means the request cannot be satisfied.
    fn request_chunk(&mut self, size: usize) -> Option<NonNull<u8>>;
}

/// Virtual memory page size of the computer. This is usually 4096.
/// Zero until first asked for.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Internal handle for platform-dependent memory operations.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The base allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len` aligned to `align` bytes. Returns
    /// a pointer to the region or None if the underlying syscalls fail.
    unsafe fn request_aligned(len: usize, align: usize) -> Option<NonNull<u8>>;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size once.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Kernel::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
        // Read-Write only memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        unsafe {
            match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }
    }

    unsafe fn return_memory(addr: *mut u8, len: usize) {
        unsafe {
            munmap(addr.cast::<c_void>(), len as size_t);
        }
    }

    impl PlatformMemory for Kernel {
        unsafe fn request_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
            unsafe {
                // Most of the time mmap already hands back suitably aligned memory.
                let addr = request_memory(len)?;
                if addr.as_ptr() as usize % align == 0 {
                    return Some(addr);
                }
                return_memory(addr.as_ptr(), len);

                // Over-map and trim the misaligned head and the excess tail.
                let padded = len.checked_add(align - super::page_size())?;
                let raw = request_memory(padded)?;
                let start = raw.as_ptr() as usize;
                let lead = crate::utils::align(start, align)? - start;
                let trail = padded - lead - len;

                if lead > 0 {
                    return_memory(raw.as_ptr(), lead);
                }
                if trail > 0 {
                    return_memory(raw.as_ptr().add(lead + len), trail);
                }

                Some(raw.add(lead))
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    /// Attempts at hitting an aligned address before giving up.
    const ALIGN_ATTEMPTS: usize = 8;

    unsafe fn request_memory_at(at: Option<*const c_void>, len: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe { NonNull::new(Memory::VirtualAlloc(at, len, flags, protection).cast()) }
    }

    unsafe fn return_memory(addr: *mut u8) {
        unsafe {
            let _ = Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE);
        }
    }

    impl PlatformMemory for Kernel {
        unsafe fn request_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = request_memory_at(None, len)?;
                if addr.as_ptr() as usize % align == 0 {
                    return Some(addr);
                }
                return_memory(addr.as_ptr());

                // Regions can't be trimmed here: probe for a large enough hole,
                // release it and race to map the aligned part of it.
                for _ in 0..ALIGN_ATTEMPTS {
                    let probe = request_memory_at(None, len.checked_add(align)?)?;
                    let aligned = crate::utils::align(probe.as_ptr() as usize, align)?;
                    return_memory(probe.as_ptr());

                    if let Some(addr) = request_memory_at(Some(aligned as *const c_void), len) {
                        return Some(addr);
                    }
                }

                None
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// [`ChunkSource`] backed by anonymous memory mappings of the operating system.
///
/// Fresh anonymous mappings are demand-zeroed, which is what lets the base
/// allocator promise zero-filled memory without touching it.
#[derive(Debug, Clone, Copy)]
pub struct OsChunks {
    granularity: usize,
}

impl OsChunks {
    /// Chunks of `1 << DEFAULT_LG_CHUNK` bytes.
    pub fn new() -> Self {
        Self::with_lg_chunk(DEFAULT_LG_CHUNK)
    }

    /// Chunks of `1 << lg_chunk` bytes, but never less than a page.
    pub fn with_lg_chunk(lg_chunk: u32) -> Self {
        let granularity = 1usize
            .checked_shl(lg_chunk)
            .unwrap_or(1 << (usize::BITS - 1));

        Self {
            granularity: granularity.max(page_size()),
        }
    }
}

impl Default for OsChunks {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSource for OsChunks {
    #[inline]
    fn granularity(&self) -> usize {
        self.granularity
    }

    fn request_chunk(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(0, size % self.granularity);

        unsafe { Kernel::request_aligned(size, self.granularity) }
    }
}
