//! Software-checked regions: `SoftMemory` and `SoftStack`.
//!
//! Same geometry, accounting and outcomes as the trap-backed regions, but
//! every access is checked explicitly before it happens and storage comes
//! from the heap. This is the portable rendition: no signal handler, no
//! address-space reservation, at the cost of a branch on every access.

use crate::layout::{host_page_size, is_valid_page_size, page_index, round_up};
use crate::region::{Access, GuardedRegion, Outcome, RegionId};
use crate::{BoundaryFault, ConstructionError, FaultKind, MemoryConfig, StackConfig};

/// Heap-backed growable memory with explicit bounds checks.
pub struct SoftMemory {
    id: RegionId,
    page_size: usize,
    max_bytes: usize,
    /// Committed pages; `None` until first touch.
    pages: Vec<Option<Box<[u8]>>>,
    allocated: usize,
    rejected: usize,
}

impl SoftMemory {
    pub fn new(max_bytes: usize, page_size: usize) -> Result<Self, ConstructionError> {
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
        max_bytes
            .checked_add(page_size)
            .ok_or(ConstructionError::SizeOverflow)?;
        let mut pages = Vec::new();
        pages.resize_with(page_index(max_bytes, page_size), || None);
        Ok(Self {
            id: RegionId::next(),
            page_size,
            max_bytes,
            pages,
            allocated: 0,
            rejected: 0,
        })
    }

    pub fn from_config(config: &MemoryConfig) -> Result<Self, ConstructionError> {
        Self::new(config.max_bytes, config.page_size())
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn reject(&mut self, offset: usize) -> Outcome<u8> {
        self.rejected += 1;
        let fault = BoundaryFault {
            kind: FaultKind::Invalid,
            region: self.id,
            offset,
        };
        log::warn!("{fault}: rejected by bounds check");
        Outcome::Diverted(fault)
    }
}

impl GuardedRegion for SoftMemory {
    fn id(&self) -> RegionId {
        self.id
    }

    fn reserved_len(&self) -> usize {
        self.max_bytes + self.page_size
    }

    fn in_bounds(&self, offset: usize) -> bool {
        offset < self.max_bytes
    }

    fn pages_allocated(&self) -> usize {
        self.allocated
    }

    fn rejected_accesses(&self) -> usize {
        self.rejected
    }

    fn grow_and_retry(&mut self, offset: usize, access: Access) -> Outcome<u8> {
        if offset >= self.max_bytes {
            return self.reject(offset);
        }
        let page_size = self.page_size;
        let index = page_index(offset, page_size);
        let Some(slot) = self.pages.get_mut(index) else {
            return self.reject(offset);
        };
        let grew = slot.is_none();
        let page = slot.get_or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
        let Some(byte) = page.get_mut(offset & (page_size - 1)) else {
            return self.reject(offset);
        };
        let value = match access {
            Access::Read => *byte,
            Access::Write(value) => {
                *byte = value;
                value
            }
        };
        if grew {
            self.allocated += 1;
            log::debug!("{}: committed page {index} on first touch", self.id);
            Outcome::Retried(value)
        } else {
            Outcome::Completed(value)
        }
    }
}

/// Heap-backed stack with explicit underflow/overflow checks.
pub struct SoftStack {
    id: RegionId,
    guard: usize,
    data: Vec<u8>,
    host_page: usize,
    rejected: usize,
}

impl SoftStack {
    pub fn new(usable_bytes: usize, guard_bytes: usize) -> Result<Self, ConstructionError> {
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
        guard_bytes
            .checked_mul(2)
            .and_then(|guards| guards.checked_add(usable_bytes))
            .ok_or(ConstructionError::SizeOverflow)?;
        Ok(Self {
            id: RegionId::next(),
            guard: guard_bytes,
            data: vec![0; usable_bytes],
            host_page: host,
            rejected: 0,
        })
    }

    pub fn from_config(config: &StackConfig) -> Result<Self, ConstructionError> {
        Self::new(config.usable_bytes, config.guard_bytes())
    }

    pub fn usable(&self) -> usize {
        self.data.len()
    }

    pub fn guard(&self) -> usize {
        self.guard
    }
}

impl GuardedRegion for SoftStack {
    fn id(&self) -> RegionId {
        self.id
    }

    fn reserved_len(&self) -> usize {
        self.data.len() + 2 * self.guard
    }

    fn in_bounds(&self, offset: usize) -> bool {
        offset >= self.guard && offset - self.guard < self.data.len()
    }

    fn pages_allocated(&self) -> usize {
        page_index(self.data.len(), self.host_page)
    }

    fn rejected_accesses(&self) -> usize {
        self.rejected
    }

    fn grow_and_retry(&mut self, offset: usize, access: Access) -> Outcome<u8> {
        let kind = if offset < self.guard {
            FaultKind::Underflow
        } else {
            match self.data.get_mut(offset - self.guard) {
                Some(byte) => {
                    return Outcome::Completed(match access {
                        Access::Read => *byte,
                        Access::Write(value) => {
                            *byte = value;
                            value
                        }
                    });
                }
                None => FaultKind::Overflow,
            }
        };
        self.rejected += 1;
        let fault = BoundaryFault {
            kind,
            region: self.id,
            offset,
        };
        log::warn!("{fault}: rejected by bounds check");
        Outcome::Diverted(fault)
    }
}
