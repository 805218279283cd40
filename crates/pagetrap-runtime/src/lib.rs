//! `pagetrap-runtime` — guard-page regions backed by the host MMU.
//!
//! This crate provides:
//! - `MemoryRegion`: a page-granular window with a hard maximum whose pages
//!   are committed on first touch by the fault handler
//! - `StackRegion`: a fixed window flanked by no-access guard zones that turn
//!   underflow and overflow into recoverable `BoundaryFault`s
//! - `SoftMemory` / `SoftStack`: the same contract enforced by explicit
//!   bounds checks instead of traps
//! - `GuardedRegion`: the access trait shared by all four
//!
//! Hardware regions install a process-wide `SIGSEGV`/`SIGBUS` handler on
//! first construction. The handler never unwinds or jumps: it fixes up page
//! permissions and returns, and the access path reads the outcome back from a
//! thread-local checkpoint (see [`recovery`]).

use core::fmt;

pub mod config;
pub mod layout;
pub mod recovery;

mod handler;
mod memory;
mod region;
mod registry;
mod software;
mod stack;
mod sys;

pub use config::{GuardMode, MemoryConfig, StackConfig};
pub use handler::install_fault_handler;
pub use layout::PAGE_SIZE;
pub use memory::MemoryRegion;
pub use recovery::{CheckpointState, FaultEvent, Resume};
pub use region::{Access, GuardedRegion, Outcome, RegionId};
pub use software::{SoftMemory, SoftStack};
pub use stack::StackRegion;

/// Classification of a protection fault inside a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// First touch of a reserved page below the region maximum.
    Growth,
    /// Access in the low guard zone of a stack.
    Underflow,
    /// Access in the high guard zone of a stack.
    Overflow,
    /// Access at or beyond the maximum of a memory region.
    Invalid,
}

impl FaultKind {
    /// Outcome tag observed at the checkpoint: 1 for a retried growth, 2 and
    /// up for the boundary kinds.
    pub const fn tag(self) -> u8 {
        match self {
            FaultKind::Growth => 1,
            FaultKind::Underflow => 2,
            FaultKind::Overflow => 3,
            FaultKind::Invalid => 4,
        }
    }

    /// Whether this kind diverts the caller to its fallback path.
    pub const fn is_boundary(self) -> bool {
        !matches!(self, FaultKind::Growth)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::Growth => "growth",
            FaultKind::Underflow => "stack underflow",
            FaultKind::Overflow => "stack overflow",
            FaultKind::Invalid => "invalid access",
        })
    }
}

/// A rejected access. The access never took effect; the caller decides
/// whether to raise it further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryFault {
    pub kind: FaultKind,
    pub region: RegionId,
    /// Offset from the region base (guard zones included).
    pub offset: usize,
}

impl fmt::Display for BoundaryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {:#x} in {}", self.kind, self.offset, self.region)
    }
}

impl std::error::Error for BoundaryFault {}

/// Result type for guarded accesses.
pub type GuardResult<T> = Result<T, BoundaryFault>;

/// Errors raised while building a region or installing the handler.
///
/// These are setup failures, not runtime faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionError {
    /// A size of zero bytes was requested.
    ZeroSize,
    /// Size arithmetic overflowed `usize`.
    SizeOverflow,
    /// Page size is not a power of two or not a multiple of the host page.
    UnsupportedPageSize { requested: usize, host: usize },
    /// Guard size is not a multiple of the host page.
    UnalignedGuard { guard: usize, host: usize },
    /// `mmap` refused the reservation.
    MapFailed { len: usize, errno: i32 },
    /// `mprotect` refused a permission change during construction.
    ProtectFailed { errno: i32 },
    /// Every slot of the active-region table is taken.
    RegistryFull { capacity: usize },
    /// The new reservation overlaps a registered region.
    OverlappingRegion { start: usize, end: usize },
    /// `sigaction` refused the fault handler.
    HandlerInstallFailed { signal: i32, errno: i32 },
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConstructionError::ZeroSize => f.write_str("region size must be non-zero"),
            ConstructionError::SizeOverflow => f.write_str("region size overflows usize"),
            ConstructionError::UnsupportedPageSize { requested, host } => write!(
                f,
                "page size {requested} must be a power of two and a multiple of the host page size {host}"
            ),
            ConstructionError::UnalignedGuard { guard, host } => write!(
                f,
                "guard size {guard} must be a multiple of the host page size {host}"
            ),
            ConstructionError::MapFailed { len, errno } => {
                write!(f, "failed to reserve {len} bytes (errno {errno})")
            }
            ConstructionError::ProtectFailed { errno } => {
                write!(f, "failed to change page permissions (errno {errno})")
            }
            ConstructionError::RegistryFull { capacity } => {
                write!(f, "active-region table is full ({capacity} regions)")
            }
            ConstructionError::OverlappingRegion { start, end } => {
                write!(f, "reservation {start:#x}..{end:#x} overlaps a registered region")
            }
            ConstructionError::HandlerInstallFailed { signal, errno } => {
                write!(f, "failed to install handler for signal {signal} (errno {errno})")
            }
        }
    }
}

impl std::error::Error for ConstructionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_follow_checkpoint_convention() {
        assert_eq!(FaultKind::Growth.tag(), 1);
        assert!(FaultKind::Underflow.tag() >= 2);
        assert!(FaultKind::Overflow.tag() >= 2);
        assert!(FaultKind::Invalid.tag() >= 2);
        assert!(!FaultKind::Growth.is_boundary());
        assert!(FaultKind::Overflow.is_boundary());
    }

    #[test]
    fn boundary_fault_names_offset_and_region() {
        let fault = BoundaryFault {
            kind: FaultKind::Overflow,
            region: RegionId::from_raw(7),
            offset: 0x9000,
        };
        assert_eq!(fault.to_string(), "stack overflow at offset 0x9000 in region#7");
    }

    #[test]
    fn construction_error_is_copy() {
        let err = ConstructionError::RegistryFull { capacity: 4 };
        let err2 = err;
        assert_eq!(err, err2);
        assert!(err.to_string().contains("full"));
    }
}
