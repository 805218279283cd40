//! Checkpoint and resume protocol between a guarded access and the fault
//! handler.
//!
//! Each thread owns one checkpoint slot. The access path arms it with the
//! target address, performs the access, then resolves it:
//!
//! ```text
//!   Idle ──arm──▶ Armed ──access ok──────────────────────────▶ Completed (tag 0)
//!                   │
//!                   ├──Growth trap──▶ Retried ──re-executed──▶ Completed (tag 1)
//!                   │
//!                   └──boundary trap──▶ Diverted ──reseal────▶ Completed (tag ≥ 2)
//! ```
//!
//! The handler never jumps. It adjusts permissions so the faulting
//! instruction can re-execute, records the transition here and returns. For
//! a boundary fault it opens the faulting guard page as a scratch window;
//! resolving the checkpoint zeroes and seals that page again before the
//! caller observes the diversion, so the access has no lasting effect.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{compiler_fence, Ordering};

use crate::region::RegionId;
use crate::sys::{self, Protection};
use crate::FaultKind;

/// A classified fault, built and consumed within one trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub address: usize,
    pub region: Option<RegionId>,
    pub kind: FaultKind,
}

/// Per-thread checkpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Idle,
    Armed {
        target: usize,
    },
    Retried {
        target: usize,
        event: FaultEvent,
    },
    Diverted {
        target: usize,
        event: FaultEvent,
        window: usize,
        window_len: usize,
    },
}

/// What the access path observes when it resolves its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// No fault; first pass.
    Clean,
    /// A page was promoted and the access re-executed successfully.
    Retried(FaultEvent),
    /// A boundary fault; the access had no effect.
    Diverted(FaultEvent),
}

impl Resume {
    pub fn tag(&self) -> u8 {
        match self {
            Resume::Clean => 0,
            Resume::Retried(event) | Resume::Diverted(event) => event.kind.tag(),
        }
    }
}

thread_local! {
    static CHECKPOINT: Cell<CheckpointState> = const { Cell::new(CheckpointState::Idle) };
}

/// Current state of this thread's checkpoint slot.
pub fn current() -> CheckpointState {
    CHECKPOINT.with(Cell::get)
}

/// An armed checkpoint. Resolving consumes it; dropping it unresolved
/// (the access panicked) still returns the slot to `Idle`.
#[must_use]
pub struct Checkpoint {
    target: usize,
    // Bound to the arming thread's slot.
    _not_send: PhantomData<*const ()>,
}

impl Checkpoint {
    /// Arm this thread's checkpoint for an access at `target`.
    ///
    /// # Panics
    /// If a checkpoint is already in flight on this thread.
    pub fn arm(target: usize) -> Self {
        CHECKPOINT.with(|slot| {
            assert_eq!(
                slot.get(),
                CheckpointState::Idle,
                "a checkpoint is already in flight on this thread"
            );
            slot.set(CheckpointState::Armed { target });
        });
        compiler_fence(Ordering::SeqCst);
        Self {
            target,
            _not_send: PhantomData,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Consume the checkpoint and report how the access ended.
    pub fn resolve(self) -> Resume {
        compiler_fence(Ordering::SeqCst);
        let state = CHECKPOINT.with(|slot| slot.replace(CheckpointState::Idle));
        core::mem::forget(self);
        match state {
            CheckpointState::Idle | CheckpointState::Armed { .. } => Resume::Clean,
            CheckpointState::Retried { event, .. } => Resume::Retried(event),
            CheckpointState::Diverted {
                event,
                window,
                window_len,
                ..
            } => {
                reseal(window, window_len);
                Resume::Diverted(event)
            }
        }
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        let state = CHECKPOINT.with(|slot| slot.replace(CheckpointState::Idle));
        if let CheckpointState::Diverted {
            window, window_len, ..
        } = state
        {
            reseal(window, window_len);
        }
    }
}

/// Arm a checkpoint, run `access` against `target`, resolve.
///
/// `access` may execute its memory operation twice at the instruction level
/// (once faulting, once re-executed), so it must have no other side effects.
pub fn guarded<T>(target: *mut u8, access: impl FnOnce(*mut u8) -> T) -> (T, Resume) {
    let checkpoint = Checkpoint::arm(target as usize);
    let value = access(target);
    (value, checkpoint.resolve())
}

/// Zero the scratch window and restore no-access. A guard that cannot be
/// sealed again no longer protects anything, so failing here is fatal.
fn reseal(window: usize, len: usize) {
    // SAFETY: the handler opened exactly this window read/write inside a
    // guard zone of a live region, and nothing else references it.
    unsafe {
        core::ptr::write_bytes(window as *mut u8, 0, len);
        if !sys::protect(window, len, Protection::None) {
            log::error!(
                "failed to reseal guard page {window:#x} (errno {}), aborting",
                sys::errno()
            );
            std::process::abort();
        }
    }
}

// ── Handler side ──────────────────────────────────────────────────────
//
// Called from the signal handler on the faulting thread. Only Cell reads
// and writes on an already-initialized const thread-local: no allocation.

/// Target of the armed checkpoint, if this thread has one in `Armed` state.
pub(crate) fn armed_target() -> Option<usize> {
    match CHECKPOINT.with(Cell::get) {
        CheckpointState::Armed { target } => Some(target),
        _ => None,
    }
}

/// `Armed → Retried`.
pub(crate) fn record_retry(event: FaultEvent) -> bool {
    CHECKPOINT.with(|slot| match slot.get() {
        CheckpointState::Armed { target } => {
            slot.set(CheckpointState::Retried { target, event });
            true
        }
        _ => false,
    })
}

/// `Armed → Diverted`, remembering the window the handler opened.
pub(crate) fn record_divert(event: FaultEvent, window: usize, window_len: usize) -> bool {
    CHECKPOINT.with(|slot| match slot.get() {
        CheckpointState::Armed { target } => {
            slot.set(CheckpointState::Diverted {
                target,
                event,
                window,
                window_len,
            });
            true
        }
        _ => false,
    })
}
