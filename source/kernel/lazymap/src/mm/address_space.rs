// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process address space: page directory plus region bookkeeping.

use lazymap_abi::{MapFlags, Prot};

use super::frame::FrameAllocator;
use super::page_table::{MapError, PageDirectory, PteFlags};
use super::placement::{find_free_range, PlacementError};
use super::region::{Region, RegionList};
use crate::config::VmConfig;
use crate::types::{PageLen, PhysAddr, VirtAddr};

/// Errors reported by [`AddressSpace::mmap`] and [`AddressSpace::munmap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MmapError {
    /// Requested length was zero or negative.
    #[error("invalid mapping length {0}")]
    InvalidLength(i32),
    /// No disjoint range left in the mapping zone.
    #[error(transparent)]
    Placement(#[from] PlacementError),
    /// Page-table reservation failed.
    #[error("page-table reservation failed: {0}")]
    Mapping(#[from] MapError),
    /// No region starts at the given address.
    #[error("no mapping starts at {0}")]
    NotMapped(VirtAddr),
    /// File-backed or shared mappings were requested.
    #[error("unsupported mapping flags {0:#x}")]
    UnsupportedFlags(u32),
}

/// Arguments of one mapping request, as decoded from the syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapRequest {
    pub hint: VirtAddr,
    pub len: i32,
    pub prot: Prot,
    pub flags: MapFlags,
    pub fd: i32,
    pub offset: u32,
}

impl MmapRequest {
    /// Private anonymous request, the only kind that gets backed.
    pub const fn anonymous(hint: VirtAddr, len: i32, prot: Prot) -> Self {
        Self {
            hint,
            len,
            prot,
            flags: MapFlags::ANONYMOUS.union(MapFlags::PRIVATE),
            fd: lazymap_abi::NO_FD,
            offset: 0,
        }
    }
}

/// Leaf flags for a page backing a region with `prot`.
///
/// 32-bit x86 leaves cannot deny reads or execution, so only the write bit carries over.
pub fn leaf_flags(prot: Prot) -> PteFlags {
    let mut flags = PteFlags::PRESENT | PteFlags::USER;
    if prot.contains(Prot::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    flags
}

/// User half of one process's virtual memory.
pub struct AddressSpace {
    config: VmConfig,
    pgdir: PageDirectory,
    regions: RegionList,
}

impl AddressSpace {
    pub fn new(config: VmConfig) -> Self {
        Self {
            pgdir: PageDirectory::new(config.kernel_base(), config.max_page_tables()),
            regions: RegionList::new(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn page_directory(&self) -> &PageDirectory {
        &self.pgdir
    }

    #[inline]
    pub fn page_directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.pgdir
    }

    #[inline]
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Region containing `va`, if any.
    pub fn region_containing(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.find_containing(va).and_then(|id| self.regions.get(id))
    }

    /// Software MMU walk of this address space.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        self.pgdir.translate(va)
    }

    /// Reserves a range for `req` and records its region. No frame is allocated.
    ///
    /// On failure no region is recorded and no page table created by this call remains.
    pub fn mmap(&mut self, req: &MmapRequest) -> Result<VirtAddr, MmapError> {
        let len = PageLen::from_request(req.len).ok_or(MmapError::InvalidLength(req.len))?;
        if cfg!(feature = "strict_map_flags")
            && (req.flags.is_file_backed() || req.flags.contains(MapFlags::SHARED))
        {
            return Err(MmapError::UnsupportedFlags(req.flags.bits()));
        }
        let start = find_free_range(&self.config, &self.pgdir, &self.regions, req.hint, len)?;
        let tables = self.pgdir.reserve_range(start, len)?;
        self.regions.insert(Region::new(
            start, req.hint, len, req.prot, req.flags, req.fd, req.offset,
        ));
        log::debug!(
            target: "mm",
            "mmap hint={} len={:#x} prot={:?} -> {} ({} new tables)",
            req.hint,
            len.bytes(),
            req.prot,
            start,
            tables
        );
        Ok(start)
    }

    /// Releases the region starting exactly at `addr` and frees any frames backing it.
    ///
    /// The whole region goes regardless of `len`. Page tables left empty and not
    /// shared with another region go too, returning their budget. Returns the
    /// released region.
    pub fn munmap<A: FrameAllocator + ?Sized>(
        &mut self,
        addr: VirtAddr,
        len: i32,
        frames: &mut A,
    ) -> Result<Region, MmapError> {
        let id = self.regions.find_start(addr).ok_or(MmapError::NotMapped(addr))?;
        let region = *self.regions.get(id).ok_or(MmapError::NotMapped(addr))?;
        let freed = self.pgdir.release_range(region.start(), region.len(), frames)?;
        self.regions.remove(id);
        let regions = &self.regions;
        let tables = self
            .pgdir
            .reclaim_tables(region.start(), region.len(), |span_start, span| regions.any_overlap(span_start, span));
        log::debug!(
            target: "mm",
            "munmap {} len={:#x} (requested {}) freed {} frames, {} tables",
            addr,
            region.len().bytes(),
            len,
            freed,
            tables
        );
        Ok(region)
    }

    /// Empties the region list for a fresh process.
    pub fn reset_regions(&mut self) {
        self.regions.destroy_all();
    }

    /// Frees every remaining descriptor. Backing frames are left to [`Self::release`].
    pub fn destroy_regions(&mut self) -> usize {
        self.regions.destroy_all()
    }

    /// Frees every frame and page table of this address space.
    pub fn release<A: FrameAllocator + ?Sized>(&mut self, frames: &mut A) -> usize {
        self.pgdir.free_all(frames)
    }
}
