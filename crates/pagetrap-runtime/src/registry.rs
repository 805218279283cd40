//! Active-region table consulted by the fault handler.
//!
//! A fixed array of slots, so lookup from the handler needs no allocation
//! and no lock. Registration and removal run in normal context under a
//! mutex; the handler only performs acquire loads.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::region::RegionState;
use crate::ConstructionError;

/// Maximum number of live hardware regions per process.
pub(crate) const MAX_REGIONS: usize = 64;

struct Slot {
    start: AtomicUsize,
    end: AtomicUsize,
    owner: AtomicPtr<RegionState>,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            owner: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: Slot = Slot::empty();
static SLOTS: [Slot; MAX_REGIONS] = [EMPTY; MAX_REGIONS];
static WRITERS: Mutex<()> = Mutex::new(());

/// Keeps a region registered; removes it on drop.
#[derive(Debug)]
pub(crate) struct Registration {
    index: usize,
}

/// Publish `state` so the handler can find it by address.
///
/// `state` must stay at a fixed address until the returned `Registration`
/// is dropped.
pub(crate) fn register(state: &RegionState) -> Result<Registration, ConstructionError> {
    let start = state.base;
    let end = start
        .checked_add(state.len)
        .ok_or(ConstructionError::SizeOverflow)?;

    let _writers = WRITERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let index = claim(&SLOTS, state, start, end)?;
    Ok(Registration { index })
}

/// Fill the first free slot of `slots` with `[start, end)`. For `SLOTS` the
/// caller holds `WRITERS`.
fn claim(
    slots: &[Slot],
    state: &RegionState,
    start: usize,
    end: usize,
) -> Result<usize, ConstructionError> {
    let mut free = None;
    for (index, slot) in slots.iter().enumerate() {
        if slot.owner.load(Ordering::Acquire).is_null() {
            free.get_or_insert(index);
            continue;
        }
        let (s, e) = (slot.start.load(Ordering::Relaxed), slot.end.load(Ordering::Relaxed));
        if start < e && s < end {
            return Err(ConstructionError::OverlappingRegion { start, end });
        }
    }
    let index = free.ok_or(ConstructionError::RegistryFull {
        capacity: slots.len(),
    })?;

    let slot = &slots[index];
    slot.start.store(start, Ordering::Relaxed);
    slot.end.store(end, Ordering::Relaxed);
    // Publishing the owner makes the range visible to the handler.
    slot.owner
        .store(state as *const RegionState as *mut RegionState, Ordering::Release);
    Ok(index)
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _writers = WRITERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = SLOTS.get(self.index) {
            slot.owner.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

/// Region whose reservation contains `addr`. Signal-safe.
pub(crate) fn lookup(addr: usize) -> Option<&'static RegionState> {
    for slot in SLOTS.iter() {
        let owner = slot.owner.load(Ordering::Acquire);
        if owner.is_null() {
            continue;
        }
        if addr >= slot.start.load(Ordering::Relaxed) && addr < slot.end.load(Ordering::Relaxed) {
            // SAFETY: a non-null owner points at a boxed RegionState that
            // outlives its Registration, and regions are used by one thread
            // at a time, so it cannot be freed while this thread faults in it.
            return Some(unsafe { &*owner });
        }
    }
    None
}
