//! mmap-backed memory regions for pools.
//!
//! A [`Region`] is caller-owned memory a pool is laid out in. Mappings are
//! `MAP_SHARED` so a process forked after allocation sees the same pool and
//! payload chunks. Explicit hugepages are attempted when requested, falling back
//! to regular pages with a transparent hugepage hint.

use std::ptr::NonNull;

use tracing::debug;

use crate::layout::align_up;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Hugepage size preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugepageSize {
    /// Regular pages. The OS may still use THP if configured system-wide.
    #[default]
    None,
    /// 2MB hugepages (MAP_HUGETLB | MAP_HUGE_2MB), falling back to regular pages.
    TwoMegabyte,
    /// 1GB hugepages (MAP_HUGETLB | MAP_HUGE_1GB), falling back to regular pages.
    OneGigabyte,
}

/// The page size actually used for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedPageSize {
    /// 1GB hugepages.
    OneGigabyte,
    /// 2MB hugepages.
    TwoMegabyte,
    /// Regular 4KB pages (possibly with THP).
    Regular,
}

impl std::fmt::Display for AllocatedPageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocatedPageSize::OneGigabyte => write!(f, "1GB hugepages"),
            AllocatedPageSize::TwoMegabyte => write!(f, "2MB hugepages"),
            AllocatedPageSize::Regular => write!(f, "4KB pages"),
        }
    }
}

/// A page-aligned, zero-filled memory mapping. Unmapped on drop.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    allocated_size: usize,
    page_size: AllocatedPageSize,
}

// SAFETY: the region is plain memory; synchronization of its contents is the
// responsibility of the pool and ring protocols layered on top.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Requested size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. Always false; zero-sized regions are rejected.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mapped size after rounding to the page size.
    #[inline]
    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    /// Page size used for the mapping.
    #[inline]
    pub fn page_size(&self) -> AllocatedPageSize {
        self.page_size
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.allocated_size);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

/// Map a region of at least `size` bytes.
pub fn allocate(size: usize, hugepage_size: HugepageSize) -> Result<Region, std::io::Error> {
    if size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "cannot allocate zero bytes",
        ));
    }

    let (page, flags, page_size) = match hugepage_size {
        HugepageSize::OneGigabyte => (GB, hugetlb_flags(GB), AllocatedPageSize::OneGigabyte),
        HugepageSize::TwoMegabyte => (2 * MB, hugetlb_flags(2 * MB), AllocatedPageSize::TwoMegabyte),
        HugepageSize::None => return map_regular(size),
    };

    let rounded = align_up(size, page);
    match flags.and_then(|flags| mmap(rounded, flags)) {
        Ok(ptr) => {
            debug!(bytes = rounded, %page_size, "mapped region");
            Ok(Region {
                ptr,
                len: size,
                allocated_size: rounded,
                page_size,
            })
        }
        Err(e) => {
            debug!(error = %e, %page_size, "hugepage mapping failed, falling back to regular pages");
            map_regular(size)
        }
    }
}

fn map_regular(size: usize) -> Result<Region, std::io::Error> {
    let rounded = align_up(size, 4 * KB);
    let ptr = mmap(rounded, 0)?;

    // Best-effort THP hint.
    #[cfg(target_os = "linux")]
    unsafe {
        let _ = libc::madvise(ptr.as_ptr() as *mut libc::c_void, rounded, libc::MADV_HUGEPAGE);
    }

    debug!(bytes = rounded, page_size = %AllocatedPageSize::Regular, "mapped region");

    Ok(Region {
        ptr,
        len: size,
        allocated_size: rounded,
        page_size: AllocatedPageSize::Regular,
    })
}

#[cfg(target_os = "linux")]
fn hugetlb_flags(page: usize) -> Result<libc::c_int, std::io::Error> {
    const MAP_HUGE_SHIFT: libc::c_int = 26;
    match page {
        GB => Ok(libc::MAP_HUGETLB | (30 << MAP_HUGE_SHIFT)),
        p if p == 2 * MB => Ok(libc::MAP_HUGETLB | (21 << MAP_HUGE_SHIFT)),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "unsupported hugepage size",
        )),
    }
}

#[cfg(not(target_os = "linux"))]
fn hugetlb_flags(_page: usize) -> Result<libc::c_int, std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "hugepages not supported on this platform",
    ))
}

fn mmap(size: usize, extra_flags: libc::c_int) -> Result<NonNull<u8>, std::io::Error> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    NonNull::new(ptr as *mut u8).ok_or_else(|| std::io::Error::other("mmap returned null"))
}
