//! Thin wrappers over `mmap`, `mprotect` and `munmap`.
//!
//! `protect` is the only call the fault handler makes into the OS, and
//! `mprotect` is async-signal-safe. Nothing here allocates.

use core::ptr::{self, NonNull};

use crate::ConstructionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    None,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Last OS error code. Reads `errno` without allocating.
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Change permissions on `[addr, addr + len)`. Both must be host-page aligned.
///
/// # Safety
/// The range must lie inside a live reservation owned by this crate.
#[inline]
pub(crate) unsafe fn protect(addr: usize, len: usize, prot: Protection) -> bool {
    libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) == 0
}

/// An anonymous, private, no-access mapping. Unmapped on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

impl Reservation {
    /// Reserve `len` bytes with no access rights. Nothing is committed.
    pub(crate) fn new(len: usize) -> Result<Self, ConstructionError> {
        if len == 0 {
            return Err(ConstructionError::ZeroSize);
        }
        // SAFETY: anonymous mapping with no fixed address; the kernel picks a
        // fresh range that aliases nothing.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | map_noreserve(),
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(ConstructionError::MapFailed { len, errno: errno() });
        }
        let base = NonNull::new(raw.cast::<u8>())
            .ok_or(ConstructionError::MapFailed { len, errno: 0 })?;
        Ok(Self { base, len })
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Change permissions on a sub-range given as an offset from the base.
    pub(crate) fn protect(
        &self,
        offset: usize,
        len: usize,
        prot: Protection,
    ) -> Result<(), ConstructionError> {
        debug_assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
        // SAFETY: the range is inside this reservation.
        if unsafe { protect(self.base() + offset, len, prot) } {
            Ok(())
        } else {
            Err(ConstructionError::ProtectFailed { errno: errno() })
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in `new`.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        if rc != 0 {
            log::error!("munmap of {:#x}+{:#x} failed (errno {})", self.base(), self.len, errno());
        }
    }
}

// The mapping is plain memory; ownership moves freely between threads.
unsafe impl Send for Reservation {}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn map_noreserve() -> libc::c_int {
    libc::MAP_NORESERVE
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn map_noreserve() -> libc::c_int {
    0
}
