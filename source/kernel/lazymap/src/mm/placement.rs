// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Placement search inside the mapping zone.
//!
//! A candidate is occupied when it overlaps a live region or any page in it has a
//! present leaf. Both checks are needed: untouched lazy regions have no present
//! leaves yet.

use super::page_table::PageDirectory;
use super::region::RegionList;
use crate::config::VmConfig;
use crate::types::{PageLen, VirtAddr};

/// Error returned when no disjoint range can be found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// Every stride up to the kernel boundary is occupied, or the length exceeds the zone.
    #[error("no free range of {len:#x} bytes below the kernel boundary")]
    Exhausted { len: u32 },
}

fn occupied(pgdir: &PageDirectory, regions: &RegionList, start: VirtAddr, len: PageLen) -> bool {
    regions.any_overlap(start, len) || pgdir.range_has_present(start, len)
}

/// Resolves the caller's hint into a usable start for a range of `len` bytes.
///
/// * null or at/above the kernel boundary: the zone base;
/// * below the zone base: an offset from the base, rounded up to a page;
/// * inside the zone: an absolute address, rounded up to a page.
///
/// A hinted candidate that leaves the zone or collides falls back to the base.
/// From the candidate the search probes forward in `len`-sized strides.
pub fn find_free_range(
    config: &VmConfig,
    pgdir: &PageDirectory,
    regions: &RegionList,
    hint: VirtAddr,
    len: PageLen,
) -> Result<VirtAddr, PlacementError> {
    let base = config.mmap_base();
    let kernel = config.kernel_base();
    let usable = |start: VirtAddr| config.zone_contains(start, len) && !occupied(pgdir, regions, start, len);

    let hinted = if hint.is_null() || hint >= kernel {
        None
    } else if hint < base {
        base.checked_add(hint.raw()).and_then(VirtAddr::page_ceil)
    } else {
        hint.page_ceil()
    };
    let candidate = match hinted {
        Some(start) if usable(start) => {
            log::trace!(target: "mm", "hint {} accepted as {}", hint, start);
            return Ok(start);
        }
        Some(start) => {
            log::trace!(target: "mm", "hint {} resolved to {} is unusable; falling back", hint, start);
            base
        }
        None => base,
    };

    let mut probe = candidate;
    loop {
        if !config.zone_contains(probe, len) {
            log::warn!(target: "mm", "mapping zone exhausted for {:#x} bytes", len.bytes());
            return Err(PlacementError::Exhausted { len: len.bytes() });
        }
        if !occupied(pgdir, regions, probe, len) {
            return Ok(probe);
        }
        log::trace!(target: "mm", "probe {} occupied", probe);
        probe = match probe.checked_add(len.bytes()) {
            Some(next) => next,
            None => return Err(PlacementError::Exhausted { len: len.bytes() }),
        };
    }
}
