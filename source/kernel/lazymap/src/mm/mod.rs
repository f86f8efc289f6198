// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management for the on-demand mapping core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageDirectory, FramePool, RegionList, AddressSpace, handle_page_fault
//! DEPENDS_ON: config::VmConfig, types::{VirtAddr, PhysAddr, PageLen}
//! INVARIANTS: Regions of one address space never overlap; `map` never backs pages;
//!             a frame is owned by at most one leaf entry

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod placement;
pub mod region;

pub use lazymap_abi::{MapFlags, Prot};

pub use address_space::{AddressSpace, MmapError, MmapRequest};
pub use fault::{handle_page_fault, FaultError, FaultOutcome, PageFaultCode};
pub use frame::{FrameAllocator, FramePool, JUNK_BYTE, MAX_POOL_FRAMES};
pub use page_table::{MapError, PageDirectory, Pte, PteFlags};
pub use placement::{find_free_range, PlacementError};
pub use region::{Region, RegionId, RegionList};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Entries in the page directory.
pub const NPDENTRIES: usize = 1024;
/// Entries in one second-level page table.
pub const NPTENTRIES: usize = 1024;
/// Bytes covered by one page-directory entry.
pub const PDE_SPAN: u64 = (NPTENTRIES * PAGE_SIZE) as u64;

static_assertions::const_assert_eq!(1usize << PAGE_SHIFT, PAGE_SIZE);
static_assertions::const_assert_eq!(PDE_SPAN * NPDENTRIES as u64, 1u64 << 32);

#[cfg(test)]
mod tests_prop;
