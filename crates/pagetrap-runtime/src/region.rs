//! State shared between a region handle and the fault handler, plus the
//! `GuardedRegion` access trait.
//!
//! A `RegionState` is boxed by its owning region so its address is stable,
//! and the registry hands that address to the handler. Everything the
//! handler touches is either immutable after construction or atomic.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::layout::{contains, page_floor, page_index};
use crate::recovery::{self, Resume};
use crate::sys::{self, Protection};
use crate::{BoundaryFault, FaultKind, GuardResult};

/// Process-unique region identifier, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

static NEXT_REGION_ID: AtomicU32 = AtomicU32::new(1);

impl RegionId {
    pub(crate) fn next() -> Self {
        RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u32) -> Self {
        RegionId(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// One guarded byte access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write(u8),
}

/// How a guarded access ended.
///
/// Mirrors the checkpoint tags: `Completed` is tag 0 (no fault), `Retried`
/// is tag 1 (a page was promoted and the access re-executed), `Diverted`
/// carries a boundary fault with tag 2 or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Retried(T),
    Diverted(BoundaryFault),
}

impl<T> Outcome<T> {
    pub fn tag(&self) -> u8 {
        match self {
            Outcome::Completed(_) => 0,
            Outcome::Retried(_) => FaultKind::Growth.tag(),
            Outcome::Diverted(fault) => fault.kind.tag(),
        }
    }

    pub fn is_diverted(&self) -> bool {
        matches!(self, Outcome::Diverted(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(v) => Outcome::Completed(f(v)),
            Outcome::Retried(v) => Outcome::Retried(f(v)),
            Outcome::Diverted(fault) => Outcome::Diverted(fault),
        }
    }

    pub fn into_result(self) -> GuardResult<T> {
        match self {
            Outcome::Completed(v) | Outcome::Retried(v) => Ok(v),
            Outcome::Diverted(fault) => Err(fault),
        }
    }
}

/// Access contract shared by the trap-backed and software-checked regions.
///
/// Offsets are relative to the start of the reservation, guard zones
/// included.
pub trait GuardedRegion {
    fn id(&self) -> RegionId;

    /// Bytes addressable by offset, guard zones included.
    fn reserved_len(&self) -> usize;

    /// Advisory check that never touches memory: would an access at
    /// `offset` succeed (possibly after growth)?
    fn in_bounds(&self, offset: usize) -> bool;

    /// Pages currently committed read/write.
    fn pages_allocated(&self) -> usize;

    /// Accesses rejected as boundary faults so far.
    fn rejected_accesses(&self) -> usize;

    /// Perform one guarded access. A first touch of an uncommitted page is
    /// retried transparently; a boundary violation comes back as
    /// `Outcome::Diverted` without having taken effect.
    fn grow_and_retry(&mut self, offset: usize, access: Access) -> Outcome<u8>;

    fn load_u8(&mut self, offset: usize) -> Outcome<u8> {
        self.grow_and_retry(offset, Access::Read)
    }

    fn store_u8(&mut self, offset: usize, value: u8) -> Outcome<()> {
        self.grow_and_retry(offset, Access::Write(value)).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Geometry {
    /// `[0, max_bytes)` grows page by page; `[max_bytes, len)` is the guard.
    Memory { max_bytes: usize, page_size: usize },
    /// `[0, guard)` and `[guard + usable, len)` are guards.
    Stack { guard: usize, usable: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Promotion {
    Promoted,
    AlreadyPresent,
    Failed,
}

pub(crate) struct RegionState {
    pub(crate) id: RegionId,
    pub(crate) base: usize,
    pub(crate) len: usize,
    pub(crate) host_page: usize,
    pub(crate) geometry: Geometry,
    pages_allocated: AtomicUsize,
    rejected: AtomicUsize,
    /// One bit per region page; empty for stacks.
    promoted: Box<[AtomicU64]>,
}

impl RegionState {
    pub(crate) fn memory(
        id: RegionId,
        base: usize,
        len: usize,
        host_page: usize,
        max_bytes: usize,
        page_size: usize,
    ) -> Self {
        let pages = page_index(max_bytes, page_size);
        let words = pages.div_ceil(64);
        Self {
            id,
            base,
            len,
            host_page,
            geometry: Geometry::Memory {
                max_bytes,
                page_size,
            },
            pages_allocated: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            promoted: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn stack(
        id: RegionId,
        base: usize,
        len: usize,
        host_page: usize,
        guard: usize,
        usable: usize,
    ) -> Self {
        Self {
            id,
            base,
            len,
            host_page,
            geometry: Geometry::Stack { guard, usable },
            pages_allocated: AtomicUsize::new(page_index(usable, host_page)),
            rejected: AtomicUsize::new(0),
            promoted: Box::new([]),
        }
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        contains(self.base, self.len, addr)
    }

    pub(crate) fn pages_allocated(&self) -> usize {
        self.pages_allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify a fault at `addr`. `None` means the address is not this
    /// region's concern (outside it, or inside a stack's usable window).
    pub(crate) fn classify(&self, addr: usize) -> Option<FaultKind> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.base;
        match self.geometry {
            Geometry::Memory { max_bytes, .. } if offset < max_bytes => Some(FaultKind::Growth),
            Geometry::Memory { .. } => Some(FaultKind::Invalid),
            Geometry::Stack { guard, .. } if offset < guard => Some(FaultKind::Underflow),
            Geometry::Stack { guard, usable } if offset - guard >= usable => {
                Some(FaultKind::Overflow)
            }
            Geometry::Stack { .. } => None,
        }
    }

    /// Kind reported for offsets past the whole reservation. Those are
    /// rejected before any access is attempted.
    pub(crate) fn beyond_reservation(&self) -> FaultKind {
        match self.geometry {
            Geometry::Memory { .. } => FaultKind::Invalid,
            Geometry::Stack { .. } => FaultKind::Overflow,
        }
    }

    /// Whether the page with this index has been promoted.
    pub(crate) fn is_promoted(&self, index: usize) -> bool {
        self.promoted
            .get(index / 64)
            .is_some_and(|word| word.load(Ordering::Acquire) & (1 << (index % 64)) != 0)
    }

    /// Grant read/write on the page containing `addr`. Signal-safe.
    ///
    /// Idempotent: a page whose bit is already set is left alone and not
    /// counted again.
    pub(crate) fn promote_page(&self, addr: usize) -> Promotion {
        let Geometry::Memory {
            max_bytes,
            page_size,
        } = self.geometry
        else {
            return Promotion::Failed;
        };
        if !self.contains(addr) || addr - self.base >= max_bytes {
            return Promotion::Failed;
        }
        let index = page_index(addr - self.base, page_size);
        let Some(word) = self.promoted.get(index / 64) else {
            return Promotion::Failed;
        };
        let bit = 1u64 << (index % 64);
        if word.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Promotion::AlreadyPresent;
        }
        let page = page_floor(addr, page_size);
        // SAFETY: the page lies below max_bytes inside this reservation.
        if !unsafe { sys::protect(page, page_size, Protection::ReadWrite) } {
            word.fetch_and(!bit, Ordering::AcqRel);
            return Promotion::Failed;
        }
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
        Promotion::Promoted
    }

    /// Host page to open temporarily so a diverted access can complete.
    #[inline]
    pub(crate) fn divert_window(&self, addr: usize) -> (usize, usize) {
        (page_floor(addr, self.host_page), self.host_page)
    }
}

/// Shared access path of the trap-backed regions.
pub(crate) fn guarded_access(state: &RegionState, offset: usize, access: Access) -> Outcome<u8> {
    if offset >= state.len {
        state.reject();
        let fault = BoundaryFault {
            kind: state.beyond_reservation(),
            region: state.id,
            offset,
        };
        log::warn!("{fault}: beyond the reservation, rejected without access");
        return Outcome::Diverted(fault);
    }

    let target = (state.base + offset) as *mut u8;
    // SAFETY: target lies inside the reservation; a disallowed access traps
    // into the handler, which either fixes the permissions or opens a
    // scratch window and records the diversion.
    let (value, resume) = recovery::guarded(target, |ptr| unsafe { perform(ptr, access) });

    match resume {
        Resume::Clean => Outcome::Completed(value),
        Resume::Retried(event) => {
            log::debug!(
                "page fault at offset {:#x} in {}: page committed, access retried",
                event.address - state.base,
                state.id
            );
            Outcome::Retried(value)
        }
        Resume::Diverted(event) => {
            let fault = BoundaryFault {
                kind: event.kind,
                region: state.id,
                offset,
            };
            log::warn!("{fault}: recovered, running fallback");
            Outcome::Diverted(fault)
        }
    }
}

/// The access itself. Volatile so it is emitted exactly once, at this
/// point, as a single byte load or store.
#[inline(never)]
unsafe fn perform(ptr: *mut u8, access: Access) -> u8 {
    match access {
        Access::Read => ptr.read_volatile(),
        Access::Write(value) => {
            ptr.write_volatile(value);
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_state() -> RegionState {
        // Never dereferenced: classification is pure arithmetic.
        RegionState::memory(RegionId::from_raw(1), 0x10_0000, 0x5000, 0x1000, 0x4000, 0x1000)
    }

    fn stack_state() -> RegionState {
        RegionState::stack(RegionId::from_raw(2), 0x20_0000, 0xA000, 0x1000, 0x1000, 0x8000)
    }

    #[test]
    fn memory_classification() {
        let s = mem_state();
        assert_eq!(s.classify(0x10_0000), Some(FaultKind::Growth));
        assert_eq!(s.classify(0x10_3FFF), Some(FaultKind::Growth));
        assert_eq!(s.classify(0x10_4000), Some(FaultKind::Invalid));
        assert_eq!(s.classify(0x10_4FFF), Some(FaultKind::Invalid));
        assert_eq!(s.classify(0x10_5000), None);
        assert_eq!(s.classify(0x0F_FFFF), None);
    }

    #[test]
    fn stack_classification() {
        let s = stack_state();
        assert_eq!(s.classify(0x20_0000), Some(FaultKind::Underflow));
        assert_eq!(s.classify(0x20_0FFF), Some(FaultKind::Underflow));
        assert_eq!(s.classify(0x20_1000), None);
        assert_eq!(s.classify(0x20_8FFF), None);
        assert_eq!(s.classify(0x20_9000), Some(FaultKind::Overflow));
        assert_eq!(s.classify(0x20_9FFF), Some(FaultKind::Overflow));
        assert_eq!(s.classify(0x20_A000), None);
    }

    #[test]
    fn stack_counts_usable_pages_up_front() {
        assert_eq!(stack_state().pages_allocated(), 8);
        assert_eq!(mem_state().pages_allocated(), 0);
    }

    #[test]
    fn promote_rejects_guard_and_stack() {
        assert_eq!(mem_state().promote_page(0x10_4000), Promotion::Failed);
        assert_eq!(stack_state().promote_page(0x20_1000), Promotion::Failed);
    }

    #[test]
    fn outcome_tags_and_mapping() {
        let fault = BoundaryFault {
            kind: FaultKind::Invalid,
            region: RegionId::from_raw(3),
            offset: 5,
        };
        assert_eq!(Outcome::Completed(1u8).tag(), 0);
        assert_eq!(Outcome::Retried(1u8).tag(), 1);
        assert_eq!(Outcome::<u8>::Diverted(fault).tag(), 4);
        assert_eq!(Outcome::Retried(2u8).map(|v| v * 2), Outcome::Retried(4));
        assert_eq!(Outcome::<u8>::Diverted(fault).into_result(), Err(fault));
        assert!(Outcome::<()>::Diverted(fault).is_diverted());
    }
}
