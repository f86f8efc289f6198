// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lazy page-fault path
//! OWNERS: @kernel-mm-team
//! PUBLIC API: handle_page_fault, PageFaultCode, FaultOutcome, FaultError
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}
//! INVARIANTS: Only not-present user faults inside an accessible region are resolved;
//!             a resolved fault backs exactly one zeroed frame; a failed install leaks
//!             no frame

use bitflags::bitflags;
use lazymap_abi::Prot;

use super::address_space::{leaf_flags, AddressSpace};
use super::frame::FrameAllocator;
use super::page_table::MapError;
use crate::types::{PhysAddr, VirtAddr};

bitflags! {
    /// Error code pushed by the CPU for a page fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// The page was present: a protection violation.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// Successful resolution of a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fresh zeroed frame now backs the page.
    Backed(PhysAddr),
    /// The page was already present; nothing changed.
    AlreadyPresent,
}

/// Faults that terminate the faulting process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("protection violation at {va}")]
    Protection { va: VirtAddr },
    #[error("kernel-mode fault at {va}")]
    KernelMode { va: VirtAddr },
    #[error("no mapping covers {va}")]
    NoRegion { va: VirtAddr },
    #[error("out of physical frames backing {va}")]
    OutOfFrames { va: VirtAddr },
    #[error("frame for {va} could not be zero-filled")]
    ZeroFill { va: VirtAddr },
    #[error("installing page at {va} failed: {source}")]
    Install { va: VirtAddr, source: MapError },
}

impl FaultError {
    /// Faulting address.
    pub fn addr(&self) -> VirtAddr {
        match *self {
            Self::Protection { va }
            | Self::KernelMode { va }
            | Self::NoRegion { va }
            | Self::OutOfFrames { va }
            | Self::ZeroFill { va }
            | Self::Install { va, .. } => va,
        }
    }
}

/// Resolves a page fault at `va` by backing the containing page of its region.
///
/// A region mapped with no access bits never gets a page; touching it is a
/// protection violation.
pub fn handle_page_fault<A: FrameAllocator + ?Sized>(
    space: &mut AddressSpace,
    frames: &mut A,
    va: VirtAddr,
    code: PageFaultCode,
) -> Result<FaultOutcome, FaultError> {
    if code.contains(PageFaultCode::PRESENT) {
        return Err(FaultError::Protection { va });
    }
    if !code.contains(PageFaultCode::USER) {
        return Err(FaultError::KernelMode { va });
    }
    let page = va.page_floor();
    let prot = space.region_containing(page).map(|region| region.prot()).ok_or(FaultError::NoRegion { va })?;
    if !prot.intersects(Prot::READ | Prot::WRITE | Prot::EXEC) {
        return Err(FaultError::Protection { va });
    }
    if space.page_directory().is_present(page) {
        log::debug!(target: "pf", "spurious fault at {}", va);
        return Ok(FaultOutcome::AlreadyPresent);
    }

    let pa = frames.alloc().ok_or(FaultError::OutOfFrames { va })?;
    if !frames.zero(pa) {
        frames.free(pa);
        return Err(FaultError::ZeroFill { va });
    }
    if let Err(source) = space.page_directory_mut().map_page(page, pa, leaf_flags(prot)) {
        frames.free(pa);
        return Err(FaultError::Install { va, source });
    }
    log::debug!(
        target: "pf",
        "backed {} with {} ({})",
        page,
        pa,
        if code.contains(PageFaultCode::WRITE) { "write" } else { "read" }
    );
    Ok(FaultOutcome::Backed(pa))
}
