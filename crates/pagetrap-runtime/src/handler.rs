//! The process-wide fault classifier.
//!
//! One `SA_SIGINFO` handler serves `SIGSEGV` and `SIGBUS` for every region.
//! It runs on the faulting thread and must stay async-signal-safe: registry
//! lookups are atomic loads, the checkpoint is a const thread-local `Cell`,
//! and the only syscalls are `mprotect`, `write` and `sigaction`.
//!
//! Priority, first match wins:
//! 1. reserved page below a memory region's maximum → promote, `Growth`
//! 2. memory guard page or stack guard zone → `Invalid` / `Underflow` /
//!    `Overflow`, count it, open a scratch window
//! 3. anything else → print the address, restore the default action, abort
//!
//! Steps 1 and 2 also require the fault to hit the page of the access this
//! thread armed; a fault in a region with no armed access has no safe
//! resumption point and falls through to step 3.

use core::ptr;
use std::sync::OnceLock;

use crate::layout::page_floor;
use crate::recovery::{self, FaultEvent};
use crate::region::Promotion;
use crate::registry;
use crate::sys::{self, Protection};
use crate::{ConstructionError, FaultKind};

const FAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

static INSTALLED: OnceLock<Result<(), ConstructionError>> = OnceLock::new();

/// Install the fault handler for `SIGSEGV` and `SIGBUS`. Idempotent; every
/// hardware region calls it on construction.
pub fn install_fault_handler() -> Result<(), ConstructionError> {
    *INSTALLED.get_or_init(|| {
        for signal in FAULT_SIGNALS {
            // SAFETY: on_fault is async-signal-safe (see module docs).
            unsafe { install(signal)? };
        }
        log::info!("fault handler installed for SIGSEGV and SIGBUS");
        Ok(())
    })
}

unsafe fn install(signal: libc::c_int) -> Result<(), ConstructionError> {
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_fault;
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
        return Err(ConstructionError::HandlerInstallFailed {
            signal,
            errno: sys::errno(),
        });
    }
    Ok(())
}

extern "C" fn on_fault(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // SAFETY: the kernel passes a valid siginfo_t for SA_SIGINFO handlers.
    let addr = unsafe { fault_address(info) };
    if let Err(event) = classify(addr) {
        unclassified(signal, event);
    }
    // Returning re-executes the faulting access against fixed permissions.
}

/// Classify a fault at `addr` and prepare the resumption. `Err` carries the
/// event of a fault that must not be resumed.
fn classify(addr: usize) -> Result<(), FaultEvent> {
    let Some(state) = registry::lookup(addr) else {
        return Err(FaultEvent {
            address: addr,
            region: None,
            kind: FaultKind::Invalid,
        });
    };
    let Some(kind) = state.classify(addr) else {
        return Err(FaultEvent {
            address: addr,
            region: Some(state.id),
            kind: FaultKind::Invalid,
        });
    };
    let event = FaultEvent {
        address: addr,
        region: Some(state.id),
        kind,
    };

    let fault_page = page_floor(addr, state.host_page);
    match recovery::armed_target() {
        Some(target) if page_floor(target, state.host_page) == fault_page => {}
        _ => return Err(event),
    }

    if kind == FaultKind::Growth {
        // AlreadyPresent means an accessible page faulted: the permission
        // table is inconsistent and retrying would loop.
        if state.promote_page(addr) != Promotion::Promoted {
            return Err(event);
        }
        recovery::record_retry(event);
        return Ok(());
    }

    let (window, len) = state.divert_window(addr);
    // SAFETY: the window is one host page inside this region's guard zone.
    if !unsafe { sys::protect(window, len, Protection::ReadWrite) } {
        return Err(event);
    }
    state.reject();
    recovery::record_divert(event, window, len);
    Ok(())
}

/// Fatal path: report, restore the default action, abort.
fn unclassified(signal: libc::c_int, event: FaultEvent) -> ! {
    let mut msg = RawMessage::new();
    msg.push(b"pagetrap: unclassified fault (signal ");
    msg.push_dec(signal as usize);
    msg.push(b") at 0x");
    msg.push_hex(event.address);
    if let Some(region) = event.region {
        msg.push(b" in region#");
        msg.push_dec(region.as_raw() as usize);
    }
    msg.push(b"\n");
    // SAFETY: write, signal and abort are async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.buf.as_ptr().cast(), msg.len);
        for sig in FAULT_SIGNALS {
            libc::signal(sig, libc::SIG_DFL);
        }
        libc::abort();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

/// Fixed-capacity message buffer; formatting without allocation.
struct RawMessage {
    buf: [u8; 128],
    len: usize,
}

impl RawMessage {
    fn new() -> Self {
        Self {
            buf: [0; 128],
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if let Some(slot) = self.buf.get_mut(self.len) {
                *slot = b;
                self.len += 1;
            }
        }
    }

    fn push_hex(&mut self, value: usize) {
        self.push_radix(value, 16);
    }

    fn push_dec(&mut self, value: usize) {
        self.push_radix(value, 10);
    }

    fn push_radix(&mut self, mut value: usize, radix: usize) {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut scratch = [0u8; 20];
        let mut i = scratch.len();
        loop {
            i -= 1;
            scratch[i] = DIGITS[value % radix];
            value /= radix;
            if value == 0 {
                break;
            }
        }
        let digits = &scratch[i..];
        self.push(digits);
    }

    #[cfg(test)]
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        assert_eq!(install_fault_handler(), Ok(()));
        assert_eq!(install_fault_handler(), Ok(()));
    }

    #[test]
    fn unregistered_address_is_unclassified() {
        let err = classify(0x10).unwrap_err();
        assert_eq!(err.region, None);
        assert_eq!(err.address, 0x10);
    }

    #[test]
    fn raw_message_formats_numbers() {
        let mut msg = RawMessage::new();
        msg.push(b"at 0x");
        msg.push_hex(0xdead_beef);
        msg.push(b" sig ");
        msg.push_dec(11);
        msg.push(b" zero ");
        msg.push_dec(0);
        assert_eq!(msg.as_str(), "at 0xdeadbeef sig 11 zero 0");
    }

    #[test]
    fn raw_message_truncates_instead_of_overflowing() {
        let mut msg = RawMessage::new();
        for _ in 0..50 {
            msg.push(b"abcd");
        }
        assert_eq!(msg.len, 128);
    }
}
