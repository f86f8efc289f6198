// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space layout and resource limits for the mapping core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmConfig, ConfigError, MMAP_BASE, KERNBASE
//! DEPENDS_ON: types::VirtAddr, mm::PAGE_SIZE
//! INVARIANTS: mmap_base < kernel_base <= KERNBASE; both page aligned; budgets non-zero;
//!             the frame pool fits below 4 GiB
//!
//! ```text
//!   +------------------+  0xffff_ffff
//!   |      kernel      |
//!   +------------------+  KERNBASE
//!   |   mapping zone   |
//!   +------------------+  MMAP_BASE
//!   |  heap / stack    |
//!   |  data / text     |
//!   +------------------+  0
//! ```

use static_assertions::const_assert;

use crate::mm::{MAX_POOL_FRAMES, NPDENTRIES, PAGE_SIZE};
use crate::types::VirtAddr;

/// Default start of the on-demand mapping zone.
pub const MMAP_BASE: u32 = 0x4000_0000;
/// First kernel address; user mappings stay strictly below it.
///
/// Also the highest boundary a configuration may use: `mmap` returns the mapped
/// address in a signed 32-bit register, so every start must stay below 2 GiB.
pub const KERNBASE: u32 = 0x8000_0000;
/// Default number of frames in the reference physical pool (16 MiB).
pub const DEFAULT_PHYS_FRAMES: usize = 4096;
/// Pages mapped eagerly for every new process (text + one stack page).
pub const DEFAULT_IMAGE_PAGES: usize = 2;

const_assert!(MMAP_BASE < KERNBASE);
const_assert!(MMAP_BASE as usize % PAGE_SIZE == 0);
const_assert!(KERNBASE as usize % PAGE_SIZE == 0);

/// Errors reported while building a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A layout address is not page aligned.
    #[error("layout address {0} is not page aligned")]
    Unaligned(VirtAddr),
    /// The mapping zone is empty or inverted.
    #[error("mapping zone [{base}, {kernel}) is empty")]
    EmptyZone { base: VirtAddr, kernel: VirtAddr },
    /// The user image would overlap the mapping zone.
    #[error("user image of {pages} pages reaches into the mapping zone")]
    ImageTooLarge { pages: usize },
    /// The zone reaches past the range `mmap` can report as a successful return.
    #[error("kernel boundary {0} lies above the user return range")]
    BoundaryTooHigh(VirtAddr),
    /// The frame pool would extend past the top of physical memory.
    #[error("frame pool of {frames} frames exceeds the limit of {max}")]
    PoolTooLarge { frames: usize, max: usize },
    /// A resource budget is zero.
    #[error("resource budget `{0}` must be non-zero")]
    ZeroBudget(&'static str),
}

/// Layout and limits shared by every address space created under this configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    mmap_base: VirtAddr,
    kernel_base: VirtAddr,
    max_page_tables: usize,
    phys_frames: usize,
    image_pages: usize,
}

impl VmConfig {
    /// Default layout: mapping zone `[0x4000_0000, 0x8000_0000)`.
    pub const fn new() -> Self {
        Self {
            mmap_base: VirtAddr::new(MMAP_BASE),
            kernel_base: VirtAddr::new(KERNBASE),
            max_page_tables: NPDENTRIES,
            phys_frames: DEFAULT_PHYS_FRAMES,
            image_pages: DEFAULT_IMAGE_PAGES,
        }
    }

    /// Moves the mapping zone to `[base, kernel)`.
    pub fn with_zone(mut self, base: u32, kernel: u32) -> Result<Self, ConfigError> {
        let base = VirtAddr::page_aligned(base).ok_or(ConfigError::Unaligned(VirtAddr::new(base)))?;
        let kernel =
            VirtAddr::page_aligned(kernel).ok_or(ConfigError::Unaligned(VirtAddr::new(kernel)))?;
        if base >= kernel {
            return Err(ConfigError::EmptyZone { base, kernel });
        }
        if kernel.raw() > KERNBASE {
            return Err(ConfigError::BoundaryTooHigh(kernel));
        }
        self.mmap_base = base;
        self.kernel_base = kernel;
        self.check_image()?;
        Ok(self)
    }

    /// Caps the number of second-level page tables one address space may own.
    pub fn with_max_page_tables(mut self, tables: usize) -> Result<Self, ConfigError> {
        if tables == 0 {
            return Err(ConfigError::ZeroBudget("max_page_tables"));
        }
        self.max_page_tables = tables.min(NPDENTRIES);
        Ok(self)
    }

    /// Sizes the reference physical frame pool.
    pub fn with_phys_frames(mut self, frames: usize) -> Result<Self, ConfigError> {
        if frames == 0 {
            return Err(ConfigError::ZeroBudget("phys_frames"));
        }
        if frames > MAX_POOL_FRAMES {
            return Err(ConfigError::PoolTooLarge { frames, max: MAX_POOL_FRAMES });
        }
        self.phys_frames = frames;
        Ok(self)
    }

    /// Sets the number of eagerly mapped image pages per process (text + stack).
    pub fn with_image_pages(mut self, pages: usize) -> Result<Self, ConfigError> {
        if pages == 0 {
            return Err(ConfigError::ZeroBudget("image_pages"));
        }
        self.image_pages = pages;
        self.check_image()?;
        Ok(self)
    }

    fn check_image(&self) -> Result<(), ConfigError> {
        let image_bytes = self.image_pages.saturating_mul(PAGE_SIZE);
        if image_bytes > self.mmap_base.raw() as usize {
            return Err(ConfigError::ImageTooLarge { pages: self.image_pages });
        }
        Ok(())
    }

    #[inline]
    pub const fn mmap_base(&self) -> VirtAddr {
        self.mmap_base
    }

    #[inline]
    pub const fn kernel_base(&self) -> VirtAddr {
        self.kernel_base
    }

    /// Size of the mapping zone in bytes.
    #[inline]
    pub const fn zone_bytes(&self) -> u32 {
        self.kernel_base.raw() - self.mmap_base.raw()
    }

    #[inline]
    pub const fn max_page_tables(&self) -> usize {
        self.max_page_tables
    }

    #[inline]
    pub const fn phys_frames(&self) -> usize {
        self.phys_frames
    }

    #[inline]
    pub const fn image_pages(&self) -> usize {
        self.image_pages
    }

    /// Returns `true` when `[start, start + len)` lies inside the mapping zone.
    #[inline]
    pub fn zone_contains(&self, start: VirtAddr, len: crate::types::PageLen) -> bool {
        start >= self.mmap_base && start.end_of(len) <= self.kernel_base.raw() as u64
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageLen;

    #[test]
    fn default_layout_matches_constants() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.mmap_base().raw(), MMAP_BASE);
        assert_eq!(cfg.kernel_base().raw(), KERNBASE);
        assert_eq!(cfg.zone_bytes(), 0x4000_0000);
        assert_eq!(cfg.max_page_tables(), NPDENTRIES);
    }

    #[test]
    fn rejects_bad_zones() {
        assert_eq!(
            VmConfig::new().with_zone(0x4000_0001, KERNBASE),
            Err(ConfigError::Unaligned(VirtAddr::new(0x4000_0001)))
        );
        assert!(matches!(
            VmConfig::new().with_zone(KERNBASE, MMAP_BASE),
            Err(ConfigError::EmptyZone { .. })
        ));
        assert_eq!(
            VmConfig::new().with_zone(0x1000, 0x10_0000),
            Err(ConfigError::ImageTooLarge { pages: DEFAULT_IMAGE_PAGES })
        );
    }

    #[test]
    fn rejects_boundaries_above_the_return_range() {
        assert_eq!(
            VmConfig::new().with_zone(KERNBASE, 0xc000_0000),
            Err(ConfigError::BoundaryTooHigh(VirtAddr::new(0xc000_0000)))
        );
        let cfg = VmConfig::new().with_zone(0x6000_0000, KERNBASE).unwrap();
        assert_eq!(cfg.kernel_base().raw(), KERNBASE);
    }

    #[test]
    fn rejects_pools_past_the_top_of_memory() {
        assert!(VmConfig::new().with_phys_frames(MAX_POOL_FRAMES).is_ok());
        assert_eq!(
            VmConfig::new().with_phys_frames(MAX_POOL_FRAMES + 1),
            Err(ConfigError::PoolTooLarge { frames: MAX_POOL_FRAMES + 1, max: MAX_POOL_FRAMES })
        );
    }

    #[test]
    fn rejects_zero_budgets() {
        assert_eq!(
            VmConfig::new().with_max_page_tables(0),
            Err(ConfigError::ZeroBudget("max_page_tables"))
        );
        assert_eq!(VmConfig::new().with_phys_frames(0), Err(ConfigError::ZeroBudget("phys_frames")));
    }

    #[test]
    fn zone_containment_is_half_open() {
        let cfg = VmConfig::new();
        let page = PageLen::from_pages(1).unwrap();
        assert!(cfg.zone_contains(VirtAddr::new(MMAP_BASE), page));
        assert!(cfg.zone_contains(VirtAddr::new(KERNBASE - 0x1000), page));
        assert!(!cfg.zone_contains(VirtAddr::new(KERNBASE), page));
        assert!(!cfg.zone_contains(VirtAddr::new(MMAP_BASE - 0x1000), page));
    }
}
