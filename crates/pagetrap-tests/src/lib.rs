//! Shared helpers for the pagetrap integration tests and benchmarks.

use std::process::{Command, Output};

use pagetrap_runtime::layout::{default_page_size, host_page_size};

/// Set in the environment of re-executed test binaries.
pub const CHILD_ENV: &str = "PAGETRAP_CHILD";

/// Region page size used by the tests.
pub fn page() -> usize {
    default_page_size()
}

/// Whether this process is a child spawned by [`run_child`].
pub fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Re-run the current test binary with only the ignored test `name`, in a
/// fresh process. Used for faults that must terminate the process.
pub fn run_child(name: &str) -> std::io::Result<Output> {
    Command::new(std::env::current_exe()?)
        .args(["--exact", name, "--ignored", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
}

/// A no-access host page that belongs to no region. Leaked on purpose: the
/// child process touching it dies anyway.
pub fn unregistered_page() -> *mut u8 {
    // SAFETY: fresh anonymous mapping, no fixed address.
    let raw = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            host_page_size(),
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    assert_ne!(raw, libc::MAP_FAILED, "mmap failed");
    raw.cast()
}

/// Deterministic permutation of `0..n` (LCG-driven Fisher–Yates).
pub fn shuffled(n: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut state = seed | 1;
    for i in (1..n).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        order.swap(i, j);
    }
    order
}
