//! pagetrap: replay guarded access scenarios against memory and stack
//! regions.
//!
//! The library half of the CLI: builds a region from its configuration,
//! performs one guarded byte store per offset and reports how each ended.

use pagetrap_runtime::layout::{host_page_size, round_up};
use pagetrap_runtime::{
    BoundaryFault, GuardMode, GuardedRegion, MemoryConfig, Outcome, RegionId, StackConfig,
    PAGE_SIZE,
};

// Re-export key types for convenience
pub use anyhow::{Context, Result};

/// Options shared by both scenarios.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: GuardMode,
    /// Offsets to touch; empty means the default scenario.
    pub offsets: Vec<usize>,
}

/// One replayed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub offset: usize,
    /// Checkpoint tag: 0 clean, 1 grown and retried, 2+ diverted.
    pub tag: u8,
    pub fault: Option<BoundaryFault>,
}

/// Result of replaying a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub region: RegionId,
    pub steps: Vec<Step>,
    pub pages_allocated: usize,
    pub rejected_accesses: usize,
}

impl Report {
    /// Steps that were diverted to the fallback path.
    pub fn recovered_faults(&self) -> usize {
        self.steps.iter().filter(|step| step.fault.is_some()).count()
    }
}

/// Default memory scenario: the first page, a page further in, the last
/// page below the maximum, and the maximum itself.
pub fn memory_scenario(max_bytes: usize) -> Vec<usize> {
    vec![0, 2 * PAGE_SIZE, max_bytes.saturating_sub(PAGE_SIZE), max_bytes]
}

/// Default stack scenario: first usable byte, low guard, a later usable
/// byte, first byte of the high guard.
pub fn stack_scenario(guard: usize, usable: usize) -> Vec<usize> {
    vec![guard, 0, 2 * guard, guard + usable]
}

/// Replay accesses against a fresh memory region.
pub fn run_memory(config: &MemoryConfig, options: &RunOptions) -> Result<Report> {
    let mut region = config
        .open(options.mode)
        .with_context(|| format!("failed to reserve {} bytes of memory", config.max_bytes))?;
    let offsets = if options.offsets.is_empty() {
        // The region rounds its maximum up to whole pages; aim at that.
        let max_bytes =
            round_up(config.max_bytes, config.page_size()).unwrap_or(config.max_bytes);
        memory_scenario(max_bytes)
    } else {
        options.offsets.clone()
    };
    Ok(replay(region.as_mut(), &offsets))
}

/// Replay accesses against a fresh stack region.
pub fn run_stack(config: &StackConfig, options: &RunOptions) -> Result<Report> {
    let mut region = config
        .open(options.mode)
        .with_context(|| format!("failed to reserve a {}-byte stack", config.usable_bytes))?;
    let offsets = if options.offsets.is_empty() {
        let usable =
            round_up(config.usable_bytes, host_page_size()).unwrap_or(config.usable_bytes);
        stack_scenario(config.guard_bytes(), usable)
    } else {
        options.offsets.clone()
    };
    Ok(replay(region.as_mut(), &offsets))
}

fn replay(region: &mut dyn GuardedRegion, offsets: &[usize]) -> Report {
    let steps = offsets
        .iter()
        .enumerate()
        .map(|(i, &offset)| {
            let outcome = region.store_u8(offset, (i % 255) as u8 + 1);
            match outcome {
                Outcome::Completed(()) => log::debug!("offset {offset:#x}: ok"),
                Outcome::Retried(()) => log::debug!("offset {offset:#x}: page committed"),
                Outcome::Diverted(fault) => {
                    log::info!("offset {offset:#x}: {} diverted to fallback", fault.kind)
                }
            }
            Step {
                offset,
                tag: outcome.tag(),
                fault: match outcome {
                    Outcome::Diverted(fault) => Some(fault),
                    Outcome::Completed(()) | Outcome::Retried(()) => None,
                },
            }
        })
        .collect();
    Report {
        region: region.id(),
        steps,
        pages_allocated: region.pages_allocated(),
        rejected_accesses: region.rejected_accesses(),
    }
}

/// Parse a byte size: plain integer, `0x` hex, or a `K`/`KiB`/`M`/`MiB`
/// suffix.
pub fn parse_size(input: &str) -> std::result::Result<usize, String> {
    let s = input.trim();
    let (digits, scale) = [("KiB", 1usize << 10), ("K", 1 << 10), ("MiB", 1 << 20), ("M", 1 << 20)]
        .iter()
        .find_map(|&(suffix, scale)| s.strip_suffix(suffix).map(|rest| (rest, scale)))
        .unwrap_or((s, 1));
    let value = match digits.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => digits.parse::<usize>(),
    }
    .map_err(|e| format!("invalid size {input:?}: {e}"))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size {input:?} overflows"))
}
