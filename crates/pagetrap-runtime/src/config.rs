//! Region configuration and the hardware/software switch.

use crate::layout::{default_page_size, host_page_size};
use crate::{
    ConstructionError, GuardedRegion, MemoryRegion, SoftMemory, SoftStack, StackRegion,
};

/// How a region enforces its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardMode {
    /// Reserve address space and let the MMU trap on first touch and on
    /// guard hits.
    #[default]
    Hardware,
    /// Explicit bounds checks before every access, heap-backed. Portable,
    /// but pays for a check on every access.
    Software,
}

/// Configuration for a growable memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Hard upper bound in bytes, rounded up to whole pages.
    pub max_bytes: usize,
    /// Page size; `None` picks [`default_page_size`].
    pub page_size: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            page_size: None,
        }
    }
}

impl MemoryConfig {
    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or_else(default_page_size)
    }

    pub fn open(&self, mode: GuardMode) -> Result<Box<dyn GuardedRegion>, ConstructionError> {
        Ok(match mode {
            GuardMode::Hardware => Box::new(MemoryRegion::from_config(self)?),
            GuardMode::Software => Box::new(SoftMemory::from_config(self)?),
        })
    }
}

/// Configuration for a bounded stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub usable_bytes: usize,
    /// Guard zone size at each end; `None` means one host page.
    pub guard_bytes: Option<usize>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            usable_bytes: 32 * 1024,
            guard_bytes: None,
        }
    }
}

impl StackConfig {
    pub fn guard_bytes(&self) -> usize {
        self.guard_bytes.unwrap_or_else(host_page_size)
    }

    pub fn open(&self, mode: GuardMode) -> Result<Box<dyn GuardedRegion>, ConstructionError> {
        Ok(match mode {
            GuardMode::Hardware => Box::new(StackRegion::from_config(self)?),
            GuardMode::Software => Box::new(SoftStack::from_config(self)?),
        })
    }
}
