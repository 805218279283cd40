//! Faults the controller cannot classify terminate the process.
//!
//! Each case re-runs this binary with a single ignored test that triggers
//! the fault, then inspects how the child died.

use std::os::unix::process::ExitStatusExt;
use std::process::Output;

use pagetrap_runtime::{install_fault_handler, MemoryRegion, StackRegion};
use pagetrap_tests::{is_child, page, run_child, unregistered_page};

fn assert_aborted(output: &Output) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child survived: {stderr}");
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{stderr}");
    assert!(stderr.contains("pagetrap: unclassified fault"), "{stderr}");
}

#[test]
fn test_unregistered_address_aborts() {
    let output = run_child("child_touch_unregistered_page").unwrap();
    assert_aborted(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("in region#"), "{stderr}");
}

#[test]
fn test_region_fault_without_checkpoint_aborts() {
    let output = run_child("child_touch_region_without_checkpoint").unwrap();
    assert_aborted(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("in region#"), "{stderr}");
}

#[test]
fn test_stack_guard_hit_without_checkpoint_aborts() {
    let output = run_child("child_hit_stack_guard_without_checkpoint").unwrap();
    assert_aborted(&output);
}

#[test]
#[ignore = "spawned by test_unregistered_address_aborts"]
fn child_touch_unregistered_page() {
    if !is_child() {
        return;
    }
    install_fault_handler().unwrap();
    let page = unregistered_page();
    // SAFETY: not safe at all; the access must kill the process.
    unsafe { page.write_volatile(1) };
    unreachable!("write to a no-access page returned");
}

#[test]
#[ignore = "spawned by test_region_fault_without_checkpoint_aborts"]
fn child_touch_region_without_checkpoint() {
    if !is_child() {
        return;
    }
    let mem = MemoryRegion::reserve(4 * page()).unwrap();
    let target = mem.base() as *mut u8;
    // SAFETY: see above; bypasses the guarded access path on purpose.
    unsafe { target.write_volatile(1) };
    unreachable!("unguarded growth fault returned");
}

#[test]
#[ignore = "spawned by test_stack_guard_hit_without_checkpoint_aborts"]
fn child_hit_stack_guard_without_checkpoint() {
    if !is_child() {
        return;
    }
    let stack = StackRegion::reserve(page(), pagetrap_runtime::layout::host_page_size()).unwrap();
    let below = (stack.base() + stack.usable_start() - 1) as *mut u8;
    // SAFETY: see above.
    unsafe { below.write_volatile(1) };
    unreachable!("unguarded underflow returned");
}
