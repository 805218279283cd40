//! Growable memory window: `MemoryRegion`.
//!
//! The whole window plus one guard page is reserved with no access rights.
//! Nothing is committed up front: the first touch of each page traps, the
//! handler promotes that single page to read/write and the access re-runs.
//! Touching the guard page just past the maximum is a recoverable
//! `Invalid` fault.
//!
//! ```text
//!   base                                   base + max   base + max + page
//!   |  page 0  |  page 1  |  ...  | page n-1 |   guard   |
//!   '-------- promoted on first touch -------'- never ---'
//! ```

use crate::layout::{self, contains, host_page_size, is_valid_page_size, round_up};
use crate::region::{self, Access, GuardedRegion, Outcome, Promotion, RegionId, RegionState};
use crate::registry::{self, Registration};
use crate::sys::Reservation;
use crate::{
    install_fault_handler, BoundaryFault, ConstructionError, FaultKind, GuardResult, MemoryConfig,
};

/// A page-granular memory window with a hard maximum and lazy commit.
pub struct MemoryRegion {
    // Field order is drop order: unregister, free the state, then unmap.
    _registration: Registration,
    state: Box<RegionState>,
    reservation: Reservation,
    max_bytes: usize,
    page_size: usize,
}

impl MemoryRegion {
    /// Reserve `max_bytes` (rounded up to whole pages) using the default
    /// page size.
    pub fn reserve(max_bytes: usize) -> Result<Self, ConstructionError> {
        Self::with_page_size(max_bytes, layout::default_page_size())
    }

    /// Build a region from a [`MemoryConfig`].
    pub fn from_config(config: &MemoryConfig) -> Result<Self, ConstructionError> {
        Self::with_page_size(config.max_bytes, config.page_size())
    }

    /// Reserve `max_bytes` (rounded up to whole pages of `page_size`).
    ///
    /// # Errors
    /// `ZeroSize` for an empty window, `UnsupportedPageSize` when the page
    /// size is not a power-of-two multiple of the host page, plus any
    /// mapping, registry or handler installation failure.
    pub fn with_page_size(max_bytes: usize, page_size: usize) -> Result<Self, ConstructionError> {
        let host = host_page_size();
        if !is_valid_page_size(page_size, host) {
            return Err(ConstructionError::UnsupportedPageSize {
                requested: page_size,
                host,
            });
        }
        if max_bytes == 0 {
            return Err(ConstructionError::ZeroSize);
        }
        let max_bytes = round_up(max_bytes, page_size).ok_or(ConstructionError::SizeOverflow)?;
        let len = max_bytes
            .checked_add(page_size)
            .ok_or(ConstructionError::SizeOverflow)?;

        install_fault_handler()?;
        let reservation = Reservation::new(len)?;
        let state = Box::new(RegionState::memory(
            RegionId::next(),
            reservation.base(),
            len,
            host,
            max_bytes,
            page_size,
        ));
        let registration = registry::register(&state)?;
        log::info!(
            "{}: reserved {max_bytes:#x} bytes ({page_size:#x}-byte pages) at {:#x}",
            state.id,
            reservation.base()
        );
        Ok(Self {
            _registration: registration,
            state,
            reservation,
            max_bytes,
            page_size,
        })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start address of the reservation.
    pub fn base(&self) -> usize {
        self.reservation.base()
    }

    /// Pure check on an absolute address: does it fall inside
    /// `[base, base + max_bytes)`?
    pub fn address_in_bounds(&self, address: usize) -> bool {
        contains(self.base(), self.max_bytes, address)
    }

    /// Whether the page at `index` has been committed.
    pub fn is_page_allocated(&self, index: usize) -> bool {
        self.state.is_promoted(index)
    }

    /// Commit the page containing `address` without going through a fault.
    /// A no-op for a page that is already committed.
    ///
    /// # Errors
    /// An `Invalid` fault when `address` is not below the maximum.
    pub fn promote_page(&self, address: usize) -> GuardResult<()> {
        match self.state.promote_page(address) {
            Promotion::Promoted | Promotion::AlreadyPresent => Ok(()),
            Promotion::Failed => Err(BoundaryFault {
                kind: FaultKind::Invalid,
                region: self.state.id,
                offset: address.wrapping_sub(self.base()),
            }),
        }
    }
}

impl GuardedRegion for MemoryRegion {
    fn id(&self) -> RegionId {
        self.state.id
    }

    fn reserved_len(&self) -> usize {
        self.reservation.len()
    }

    fn in_bounds(&self, offset: usize) -> bool {
        offset < self.max_bytes
    }

    fn pages_allocated(&self) -> usize {
        self.state.pages_allocated()
    }

    fn rejected_accesses(&self) -> usize {
        self.state.rejected()
    }

    fn grow_and_retry(&mut self, offset: usize, access: Access) -> Outcome<u8> {
        region::guarded_access(&self.state, offset, access)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        log::info!(
            "{}: released ({} pages committed, {} accesses rejected)",
            self.state.id,
            self.state.pages_allocated(),
            self.state.rejected()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> usize {
        layout::default_page_size()
    }

    #[test]
    fn reserve_rounds_up_and_commits_nothing() {
        let mem = MemoryRegion::reserve(page() + 1).unwrap();
        assert_eq!(mem.max_bytes(), 2 * page());
        assert_eq!(mem.reserved_len(), 3 * page());
        assert_eq!(mem.pages_allocated(), 0);
        assert!(!mem.is_page_allocated(0));
    }

    #[test]
    fn zero_and_bad_page_sizes_are_rejected() {
        assert!(matches!(MemoryRegion::reserve(0), Err(ConstructionError::ZeroSize)));
        assert!(matches!(
            MemoryRegion::with_page_size(page(), 3 * page()),
            Err(ConstructionError::UnsupportedPageSize { .. })
        ));
    }

    #[test]
    fn first_touch_grows_then_completes() {
        let mut mem = MemoryRegion::reserve(4 * page()).unwrap();
        assert_eq!(mem.store_u8(10, 7), Outcome::Retried(()));
        assert_eq!(mem.pages_allocated(), 1);
        assert_eq!(mem.load_u8(10), Outcome::Completed(7));
        assert_eq!(mem.store_u8(page() - 1, 1), Outcome::Completed(()));
        assert_eq!(mem.pages_allocated(), 1);
        assert!(mem.is_page_allocated(0));
    }

    #[test]
    fn read_of_fresh_page_is_zero() {
        let mut mem = MemoryRegion::reserve(2 * page()).unwrap();
        assert_eq!(mem.load_u8(page() + 3), Outcome::Retried(0));
    }

    #[test]
    fn guard_page_is_invalid_and_stays_sealed() {
        let mut mem = MemoryRegion::reserve(page()).unwrap();
        let outcome = mem.store_u8(page(), 0xff);
        let fault = outcome.into_result().unwrap_err();
        assert_eq!(fault.kind, FaultKind::Invalid);
        assert_eq!(fault.offset, page());
        assert_eq!(mem.rejected_accesses(), 1);
        // Sealed again: a second attempt traps the same way and reads nothing.
        assert!(mem.load_u8(page()).is_diverted());
        assert_eq!(mem.rejected_accesses(), 2);
        assert_eq!(mem.pages_allocated(), 0);
    }

    #[test]
    fn beyond_reservation_is_rejected_without_access() {
        let mut mem = MemoryRegion::reserve(page()).unwrap();
        let outcome = mem.load_u8(usize::MAX);
        assert_eq!(outcome.tag(), FaultKind::Invalid.tag());
        assert_eq!(mem.rejected_accesses(), 1);
    }

    #[test]
    fn explicit_promotion_is_idempotent() {
        let mut mem = MemoryRegion::reserve(2 * page()).unwrap();
        let addr = mem.base() + page();
        mem.promote_page(addr).unwrap();
        mem.promote_page(addr + 1).unwrap();
        assert_eq!(mem.pages_allocated(), 1);
        assert_eq!(mem.store_u8(page() + 1, 3), Outcome::Completed(()));
        assert!(mem.promote_page(mem.base() + 2 * page()).is_err());
    }

    #[test]
    fn region_moves_to_another_thread() {
        let mut mem = MemoryRegion::reserve(2 * page()).unwrap();
        mem.store_u8(0, 9).into_result().unwrap();
        let handle = std::thread::spawn(move || (mem.load_u8(0), mem.store_u8(page(), 1)));
        assert_eq!(
            handle.join().unwrap(),
            (Outcome::Completed(9), Outcome::Retried(()))
        );
    }

    #[test]
    fn address_bounds_check() {
        let mem = MemoryRegion::reserve(page()).unwrap();
        assert!(mem.address_in_bounds(mem.base()));
        assert!(mem.address_in_bounds(mem.base() + page() - 1));
        assert!(!mem.address_in_bounds(mem.base() + page()));
        assert!(!mem.address_in_bounds(mem.base().wrapping_sub(1)));
        assert!(mem.in_bounds(0));
        assert!(!mem.in_bounds(page()));
    }
}
