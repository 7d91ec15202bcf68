//! Virtual memory operations for fiber stacks
//!
//! Stacks are carved from large anonymous mappings. The pool needs five
//! operations on them and nothing else, so they sit behind [`PageProvider`]:
//! the production implementation is [`OsPages`] (mmap/mprotect/madvise), and
//! tests wrap it to inject failures.
//!
//! Addresses are passed as `usize`. Nothing here dereferences them.

use std::io;

/// Page-granular virtual memory operations
pub trait PageProvider: Send + Sync {
    /// Size of one page in bytes
    fn page_size(&self) -> usize;

    /// Granularity that reservations are rounded up to
    fn allocation_granularity(&self) -> usize {
        self.page_size()
    }

    /// Reserve and commit `len` bytes of read/write memory; returns the low address.
    fn reserve(&self, len: usize) -> io::Result<usize>;

    /// Make `[addr, addr + len)` inaccessible.
    fn guard(&self, addr: usize, len: usize) -> io::Result<()>;

    /// Release the physical pages behind `[addr, addr + len)`, keeping the mapping.
    fn uncommit(&self, addr: usize, len: usize) -> io::Result<()>;

    /// Unmap `[addr, addr + len)` entirely.
    fn release(&self, addr: usize, len: usize) -> io::Result<()>;
}

/// `PageProvider` backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPages;

impl PageProvider for OsPages {
    fn page_size(&self) -> usize {
        os_page_size()
    }

    fn reserve(&self, len: usize) -> io::Result<usize> {
        // SAFETY: anonymous private mapping at a kernel-chosen address
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as usize)
    }

    fn guard(&self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller passes a page-aligned range inside one of our mappings
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn uncommit(&self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: as for guard; MADV_DONTNEED keeps the mapping and its protection
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn release(&self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller owns the whole mapping and nothing references it any more
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The system page size
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// `None` when the result does not fit in `usize`.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Bounds of the calling OS thread's own stack
///
/// `base` is the high end; the stack grows down towards `base - size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStackBounds {
    pub base: usize,
    pub size: usize,
}

impl ThreadStackBounds {
    /// Query the bounds of the current thread's stack.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn current() -> io::Result<Self> {
        // SAFETY: attr is initialised by pthread_getattr_np and destroyed below
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            let mut low: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut low, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self {
                base: low as usize + size,
                size,
            })
        }
    }

    /// Query the bounds of the current thread's stack.
    #[cfg(target_os = "macos")]
    pub fn current() -> io::Result<Self> {
        // SAFETY: both calls only read the current thread's descriptor
        unsafe {
            let this = libc::pthread_self();
            let base = libc::pthread_get_stackaddr_np(this) as usize;
            let size = libc::pthread_get_stacksize_np(this);
            Ok(Self { base, size })
        }
    }

    /// Query the bounds of the current thread's stack.
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    pub fn current() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread stack bounds are not available on this platform",
        ))
    }

    /// Lowest address of the stack
    pub fn low(&self) -> usize {
        self.base - self.size
    }
}
