// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for placement and the lazy fault path
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Successful map results stay pairwise disjoint and inside the zone
//!   - Mapping never consumes physical frames
//!   - Unmap returns every frame the fault path handed out
//!
//! TEST_SCENARIOS:
//!   - map_results_are_disjoint_and_in_zone(): random hints/lengths with interleaved unmaps
//!   - map_never_backs_pages(): free frame count unchanged by any map sequence
//!   - touched_pages_are_reclaimed_by_unmap(): random touches then unmap restore the pool

extern crate alloc;

use alloc::vec::Vec;

use proptest::prelude::*;

use super::*;
use crate::config::VmConfig;
use crate::types::VirtAddr;

const ZONE_BASE: u32 = 0x4000_0000;
const ZONE_END: u32 = 0x4010_0000;

fn small_zone() -> VmConfig {
    VmConfig::new().with_zone(ZONE_BASE, ZONE_END).unwrap()
}

#[derive(Clone, Debug)]
enum Op {
    Map { hint: u32, len: i32 },
    Unmap { pick: usize },
}

fn arb_hint() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(0u32),
        0u32..0x20_0000,
        ZONE_BASE..ZONE_END,
        ZONE_END..=u32::MAX,
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_hint(), 1i32..0x6000).prop_map(|(hint, len)| Op::Map { hint, len }),
        1 => any::<usize>().prop_map(|pick| Op::Unmap { pick }),
    ]
}

fn assert_disjoint(space: &AddressSpace) -> Result<(), TestCaseError> {
    let regions: Vec<_> = space.regions().iter().map(|(_, r)| *r).collect();
    for (i, a) in regions.iter().enumerate() {
        prop_assert!(a.start().raw() >= ZONE_BASE);
        prop_assert!(a.end() <= ZONE_END as u64);
        prop_assert!(a.start().is_page_aligned());
        for b in &regions[i + 1..] {
            prop_assert!(!a.overlaps(b.start(), b.len()), "{:?} overlaps {:?}", a, b);
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn map_results_are_disjoint_and_in_zone(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let mut pool = FramePool::new(16);
        let mut space = AddressSpace::new(small_zone());
        let mut live: Vec<VirtAddr> = Vec::new();
        for op in ops {
            match op {
                Op::Map { hint, len } => match space.mmap(&MmapRequest::anonymous(VirtAddr::new(hint), len, Prot::RW)) {
                    Ok(addr) => {
                        prop_assert!(addr.is_page_aligned());
                        live.push(addr);
                    }
                    Err(err) => prop_assert!(matches!(err, MmapError::Placement(_))),
                },
                Op::Unmap { pick } if !live.is_empty() => {
                    let addr = live.swap_remove(pick % live.len());
                    prop_assert!(space.munmap(addr, 0, &mut pool).is_ok());
                }
                Op::Unmap { .. } => {}
            }
            assert_disjoint(&space)?;
            prop_assert_eq!(space.regions().len(), live.len());
        }
    }

    #[test]
    fn map_never_backs_pages(lens in proptest::collection::vec(1i32..0x10_000, 1..32)) {
        let pool = FramePool::new(8);
        let mut space = AddressSpace::new(small_zone());
        for len in lens {
            let _ = space.mmap(&MmapRequest::anonymous(VirtAddr::new(0), len, Prot::RW));
            prop_assert_eq!(pool.free_count(), 8);
            prop_assert_eq!(space.page_directory().present_pages(), 0);
        }
    }

    #[test]
    fn touched_pages_are_reclaimed_by_unmap(pages in 1u32..16, touches in proptest::collection::vec(any::<u32>(), 0..32)) {
        let mut pool = FramePool::new(16);
        let mut space = AddressSpace::new(small_zone());
        let len = (pages * 4096) as i32;
        let addr = space.mmap(&MmapRequest::anonymous(VirtAddr::new(0), len, Prot::RW)).unwrap();
        for t in touches {
            let va = VirtAddr::new(addr.raw() + t % (pages * 4096));
            let outcome = handle_page_fault(&mut space, &mut pool, va, PageFaultCode::USER);
            prop_assert!(outcome.is_ok());
        }
        let backed = space.page_directory().present_pages();
        prop_assert_eq!(pool.free_count(), 16 - backed);
        space.munmap(addr, len, &mut pool).unwrap();
        prop_assert_eq!(pool.free_count(), 16);
    }
}
