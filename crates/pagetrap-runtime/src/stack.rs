//! Bounded stack window: `StackRegion`.
//!
//! ```text
//!   0          guard               guard + usable        len
//!   |   guard   |   usable (rw)    |        guard        |
//!     Underflow                          Overflow
//! ```
//!
//! The usable window is committed at construction and permissions never
//! change afterwards. Boundary detection is purely by address: a trap in the
//! low guard is an underflow, in the high guard an overflow.

use crate::layout::{contains, host_page_size, round_up};
use crate::region::{self, Access, GuardedRegion, Outcome, RegionId, RegionState};
use crate::registry::{self, Registration};
use crate::sys::{Protection, Reservation};
use crate::{install_fault_handler, ConstructionError, FaultKind, StackConfig};

/// A fixed-capacity window between two permanent guard zones.
pub struct StackRegion {
    _registration: Registration,
    state: Box<RegionState>,
    reservation: Reservation,
    usable: usize,
    guard: usize,
}

impl StackRegion {
    /// Reserve `usable_bytes + 2 * guard_bytes` and open the middle window.
    ///
    /// # Errors
    /// The usable size is rounded up to whole host pages; the guard must
    /// already be a multiple of the host page (`UnalignedGuard`). `ZeroSize`
    /// for an empty window or guard, plus any mapping, registry or handler
    /// installation failure.
    pub fn reserve(usable_bytes: usize, guard_bytes: usize) -> Result<Self, ConstructionError> {
        let host = host_page_size();
        if usable_bytes == 0 || guard_bytes == 0 {
            return Err(ConstructionError::ZeroSize);
        }
        if guard_bytes % host != 0 {
            return Err(ConstructionError::UnalignedGuard {
                guard: guard_bytes,
                host,
            });
        }
        let usable_bytes = round_up(usable_bytes, host).ok_or(ConstructionError::SizeOverflow)?;
        let len = guard_bytes
            .checked_mul(2)
            .and_then(|guards| guards.checked_add(usable_bytes))
            .ok_or(ConstructionError::SizeOverflow)?;

        install_fault_handler()?;
        let reservation = Reservation::new(len)?;
        reservation.protect(guard_bytes, usable_bytes, Protection::ReadWrite)?;
        let state = Box::new(RegionState::stack(
            RegionId::next(),
            reservation.base(),
            len,
            host,
            guard_bytes,
            usable_bytes,
        ));
        let registration = registry::register(&state)?;
        log::info!(
            "{}: stack of {usable_bytes:#x} bytes with {guard_bytes:#x}-byte guards at {:#x}",
            state.id,
            reservation.base()
        );
        Ok(Self {
            _registration: registration,
            state,
            reservation,
            usable: usable_bytes,
            guard: guard_bytes,
        })
    }

    /// Build a stack from a [`StackConfig`].
    pub fn from_config(config: &StackConfig) -> Result<Self, ConstructionError> {
        Self::reserve(config.usable_bytes, config.guard_bytes())
    }

    pub fn usable(&self) -> usize {
        self.usable
    }

    pub fn guard(&self) -> usize {
        self.guard
    }

    pub fn base(&self) -> usize {
        self.reservation.base()
    }

    /// Offset of the first usable byte.
    pub fn usable_start(&self) -> usize {
        self.guard
    }

    /// Classify an absolute address: `Underflow` in the low guard,
    /// `Overflow` in the high guard, `None` anywhere else.
    pub fn classify(&self, address: usize) -> Option<FaultKind> {
        self.state.classify(address)
    }
}

impl GuardedRegion for StackRegion {
    fn id(&self) -> RegionId {
        self.state.id
    }

    fn reserved_len(&self) -> usize {
        self.reservation.len()
    }

    fn in_bounds(&self, offset: usize) -> bool {
        contains(self.guard, self.usable, offset)
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

impl Drop for StackRegion {
    fn drop(&mut self) {
        log::info!(
            "{}: stack released ({} boundary faults)",
            self.state.id,
            self.state.rejected()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> usize {
        host_page_size()
    }

    #[test]
    fn usable_window_is_open_from_construction() {
        let mut stack = StackRegion::reserve(8 * page(), page()).unwrap();
        let g = stack.usable_start();
        assert_eq!(stack.store_u8(g, 1), Outcome::Completed(()));
        assert_eq!(stack.load_u8(g + 8 * page() - 1), Outcome::Completed(0));
        assert_eq!(stack.pages_allocated(), 8);
    }

    #[test]
    fn guards_divert_with_direction() {
        let mut stack = StackRegion::reserve(2 * page(), page()).unwrap();
        let g = stack.guard();
        let s = stack.usable();
        assert_eq!(
            stack.store_u8(g - 1, 1).into_result().unwrap_err().kind,
            FaultKind::Underflow
        );
        assert_eq!(
            stack.load_u8(g + s).into_result().unwrap_err().kind,
            FaultKind::Overflow
        );
        assert_eq!(stack.rejected_accesses(), 2);
    }

    #[test]
    fn classify_by_address() {
        let stack = StackRegion::reserve(page(), page()).unwrap();
        let base = stack.base();
        assert_eq!(stack.classify(base), Some(FaultKind::Underflow));
        assert_eq!(stack.classify(base + page()), None);
        assert_eq!(stack.classify(base + 2 * page()), Some(FaultKind::Overflow));
        assert_eq!(stack.classify(base + 3 * page()), None);
    }

    #[test]
    fn beyond_reservation_is_overflow() {
        let mut stack = StackRegion::reserve(page(), page()).unwrap();
        let outcome = stack.load_u8(3 * page());
        assert_eq!(outcome.tag(), FaultKind::Overflow.tag());
        assert_eq!(stack.rejected_accesses(), 1);
    }

    #[test]
    fn unaligned_sizes_are_rejected() {
        assert!(matches!(
            StackRegion::reserve(page(), page() / 2),
            Err(ConstructionError::UnalignedGuard { .. })
        ));
        assert!(matches!(StackRegion::reserve(0, page()), Err(ConstructionError::ZeroSize)));
    }

    #[test]
    fn usable_rounds_up_to_host_page() {
        let stack = StackRegion::reserve(page() + 1, page()).unwrap();
        assert_eq!(stack.usable(), 2 * page());
        assert_eq!(stack.reserved_len(), 4 * page());
    }

    #[test]
    fn stack_moves_to_another_thread() {
        let stack = StackRegion::reserve(page(), page()).unwrap();
        let handle = std::thread::spawn(move || {
            let mut stack = stack;
            (stack.load_u8(page()), stack.load_u8(0).tag())
        });
        assert_eq!(
            handle.join().unwrap(),
            (Outcome::Completed(0), FaultKind::Underflow.tag())
        );
    }

    #[test]
    fn in_bounds_matches_usable_window() {
        let stack = StackRegion::reserve(page(), page()).unwrap();
        assert!(!stack.in_bounds(page() - 1));
        assert!(stack.in_bounds(page()));
        assert!(stack.in_bounds(2 * page() - 1));
        assert!(!stack.in_bounds(2 * page()));
    }
}
