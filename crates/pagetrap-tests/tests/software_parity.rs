//! Trap-backed and bounds-checked regions must agree access for access.

use pagetrap_runtime::layout::host_page_size;
use pagetrap_runtime::{
    GuardMode, GuardedRegion, MemoryConfig, MemoryRegion, Outcome, SoftMemory, SoftStack,
    StackConfig, StackRegion,
};
use pagetrap_tests::{page, shuffled};

/// Replay `offsets` against both regions, alternating loads and stores.
fn replay(hw: &mut dyn GuardedRegion, sw: &mut dyn GuardedRegion, offsets: &[usize]) {
    for (i, &offset) in offsets.iter().enumerate() {
        let (a, b) = if i % 3 == 2 {
            (hw.load_u8(offset), sw.load_u8(offset))
        } else {
            let value = (i % 255) as u8 + 1;
            (
                hw.store_u8(offset, value).map(|()| value),
                sw.store_u8(offset, value).map(|()| value),
            )
        };
        match (a, b) {
            (Outcome::Diverted(x), Outcome::Diverted(y)) => {
                assert_eq!((x.kind, x.offset), (y.kind, y.offset), "offset {offset:#x}")
            }
            (a, b) => assert_eq!(a, b, "offset {offset:#x}"),
        }
    }
    assert_eq!(hw.pages_allocated(), sw.pages_allocated());
    assert_eq!(hw.rejected_accesses(), sw.rejected_accesses());
}

#[test]
fn test_memory_parity() {
    let pages = 16;
    let max = pages * page();
    for seed in [3u64, 11, 99] {
        let mut hw = MemoryRegion::reserve(max).unwrap();
        let mut sw = SoftMemory::new(max, page()).unwrap();
        // Every page, the guard page and one past the reservation.
        let offsets: Vec<usize> = shuffled(pages + 2, seed)
            .into_iter()
            .map(|index| index * page() + (seed as usize * 31) % page())
            .collect();
        replay(&mut hw, &mut sw, &offsets);
        replay(&mut hw, &mut sw, &offsets);
        assert_eq!(hw.pages_allocated(), pages);
    }
}

#[test]
fn test_stack_parity() {
    let host = host_page_size();
    let mut hw = StackRegion::reserve(4 * host, host).unwrap();
    let mut sw = SoftStack::new(4 * host, host).unwrap();
    assert_eq!(hw.reserved_len(), sw.reserved_len());
    let offsets = [
        host,
        0,
        host - 1,
        5 * host - 1,
        5 * host,
        6 * host - 1,
        6 * host,
        2 * host + 7,
        2 * host + 7,
    ];
    replay(&mut hw, &mut sw, &offsets);
    assert_eq!(sw.rejected_accesses(), 5);
}

#[test]
fn test_config_opens_either_mode() {
    let memory = MemoryConfig {
        max_bytes: 4 * page(),
        page_size: None,
    };
    let stack = StackConfig {
        usable_bytes: 2 * host_page_size(),
        guard_bytes: None,
    };
    let mut hw_mem = memory.open(GuardMode::Hardware).unwrap();
    let mut sw_mem = memory.open(GuardMode::Software).unwrap();
    replay(&mut *hw_mem, &mut *sw_mem, &[0, page(), 4 * page(), 0]);

    let mut hw_stack = stack.open(GuardMode::Hardware).unwrap();
    let mut sw_stack = stack.open(GuardMode::Software).unwrap();
    let host = host_page_size();
    replay(&mut *hw_stack, &mut *sw_stack, &[host, 0, 3 * host, 4 * host]);
}
