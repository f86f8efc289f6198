// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level 32-bit page directory allocating second-level tables on demand.
//!
//! A virtual address splits 10/10/12 into directory index, table index and page
//! offset. Second-level tables are reserved structurally by [`PageDirectory::reserve_range`]
//! without installing any present leaf; leaves appear one page at a time through
//! [`PageDirectory::map_page`].

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;

use super::frame::FrameAllocator;
use super::{NPDENTRIES, NPTENTRIES, PAGE_SIZE, PDE_SPAN};
use crate::types::{PageLen, PhysAddr, VirtAddr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in the low bits of a page-table entry.
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;
    }
}

const ADDR_MASK: u32 = !0xfff;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address is not page aligned")]
    Unaligned,
    /// Range reaches at or above the user limit.
    #[error("range extends past the user limit")]
    OutOfRange,
    /// A present leaf already occupies the page.
    #[error("page is already mapped")]
    Overlap,
    /// Flags do not describe a present leaf.
    #[error("flags do not describe a present leaf")]
    InvalidFlags,
    /// The second-level table budget for this directory is spent.
    #[error("page-table budget exhausted")]
    TablesExhausted,
}

/// A single 32-bit page-table entry: frame address in bits 31..12, flags below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    #[inline]
    pub const fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self((pa.raw() & ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [Pte; NPTENTRIES],
}

impl PageTablePage {
    fn new() -> Box<Self> {
        Box::new(Self { entries: [Pte(0); NPTENTRIES] })
    }

    fn present_count(&self) -> usize {
        self.entries.iter().filter(|pte| pte.is_present()).count()
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageTablePage>(), PAGE_SIZE);

/// Per-process page directory.
///
/// Only the user half below `limit` is managed here; the kernel half is shared by
/// every process and never appears in this structure.
pub struct PageDirectory {
    tables: Vec<Option<Box<PageTablePage>>>,
    limit: VirtAddr,
    table_count: usize,
    max_tables: usize,
}

impl PageDirectory {
    /// Creates an empty directory covering `[0, limit)` that may own at most
    /// `max_tables` second-level tables.
    pub fn new(limit: VirtAddr, max_tables: usize) -> Self {
        let mut tables = Vec::with_capacity(NPDENTRIES);
        tables.resize_with(NPDENTRIES, || None);
        Self { tables, limit, table_count: 0, max_tables: max_tables.min(NPDENTRIES) }
    }

    /// Number of second-level tables currently owned.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.table_count
    }

    /// First address not managed by this directory.
    #[inline]
    pub fn limit(&self) -> VirtAddr {
        self.limit
    }

    fn check_range(&self, start: VirtAddr, len: PageLen) -> Result<(), MapError> {
        if !start.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if start.end_of(len) > self.limit.raw() as u64 {
            return Err(MapError::OutOfRange);
        }
        Ok(())
    }

    /// Directory slots touched by `[start, start + len)`.
    fn slots(start: VirtAddr, len: PageLen) -> core::ops::RangeInclusive<usize> {
        let last = VirtAddr::new((start.end_of(len) - 1) as u32);
        start.pdx()..=last.pdx()
    }

    /// Ensures every second-level table covering `[start, start + len)` exists.
    ///
    /// No leaf entry is written. If the table budget runs out part way, the tables
    /// created by this call are released again and the directory is left as it was.
    /// Returns the number of tables created.
    pub fn reserve_range(&mut self, start: VirtAddr, len: PageLen) -> Result<usize, MapError> {
        self.check_range(start, len)?;
        let mut created: Vec<usize> = Vec::new();
        for slot in Self::slots(start, len) {
            if self.tables[slot].is_some() {
                continue;
            }
            if self.table_count >= self.max_tables {
                for undo in created.drain(..) {
                    self.tables[undo] = None;
                    self.table_count -= 1;
                }
                log::warn!(
                    target: "mm",
                    "page-table budget of {} exhausted reserving {}+{:#x}",
                    self.max_tables,
                    start,
                    len.bytes()
                );
                return Err(MapError::TablesExhausted);
            }
            self.tables[slot] = Some(PageTablePage::new());
            self.table_count += 1;
            created.push(slot);
        }
        Ok(created.len())
    }

    /// Returns `true` when the table covering `va` exists.
    pub fn is_reserved(&self, va: VirtAddr) -> bool {
        va < self.limit && self.tables[va.pdx()].is_some()
    }

    /// Returns the leaf entry for `va`, present or not, if its table exists.
    pub fn walk(&self, va: VirtAddr) -> Option<Pte> {
        if va >= self.limit {
            return None;
        }
        self.tables[va.pdx()].as_ref().map(|table| table.entries[va.ptx()])
    }

    /// Software MMU: resolves `va` to the physical address of the byte it names.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let pte = self.walk(va).filter(|pte| pte.is_present())?;
        let pa = PhysAddr::new(pte.addr().raw() | va.page_offset() as u32);
        Some((pa, pte.flags()))
    }

    /// Returns `true` when a present leaf maps the page containing `va`.
    #[inline]
    pub fn is_present(&self, va: VirtAddr) -> bool {
        self.walk(va).map_or(false, Pte::is_present)
    }

    /// Returns `true` when any page of `[start, start + len)` has a present leaf.
    ///
    /// Slots without a table are skipped whole.
    pub fn range_has_present(&self, start: VirtAddr, len: PageLen) -> bool {
        let end = start.end_of(len).min(self.limit.raw() as u64);
        let mut cursor = start.page_floor().raw() as u64;
        while cursor < end {
            let va = VirtAddr::new(cursor as u32);
            let slot_end = ((cursor / PDE_SPAN) + 1) * PDE_SPAN;
            match self.tables[va.pdx()].as_ref() {
                None => cursor = slot_end,
                Some(table) => {
                    let stop = slot_end.min(end);
                    let first = va.ptx();
                    let count = ((stop - cursor) as usize + PAGE_SIZE - 1) / PAGE_SIZE;
                    if table.entries[first..first + count].iter().any(|pte| pte.is_present()) {
                        return true;
                    }
                    cursor = stop;
                }
            }
        }
        false
    }

    /// Installs a present leaf mapping the page at `va` to frame `pa`.
    ///
    /// The covering table is created if missing, subject to the table budget.
    pub fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if va >= self.limit {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let slot = va.pdx();
        if self.tables[slot].is_none() {
            if self.table_count >= self.max_tables {
                return Err(MapError::TablesExhausted);
            }
            self.tables[slot] = Some(PageTablePage::new());
            self.table_count += 1;
        }
        let Some(table) = self.tables[slot].as_mut() else {
            return Err(MapError::OutOfRange);
        };
        let entry = &mut table.entries[va.ptx()];
        if entry.is_present() {
            return Err(MapError::Overlap);
        }
        *entry = Pte::new(pa, flags);
        Ok(())
    }

    /// Clears the leaf at `va` and returns the frame it mapped.
    pub fn unmap_page(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        if va >= self.limit {
            return None;
        }
        let table = self.tables[va.pdx()].as_mut()?;
        let entry = &mut table.entries[va.ptx()];
        if !entry.is_present() {
            return None;
        }
        let pa = entry.addr();
        *entry = Pte::default();
        Some(pa)
    }

    /// Clears every leaf in `[start, start + len)` and frees the frames they mapped.
    ///
    /// Tables stay in place; see [`Self::reclaim_tables`]. Returns the number of
    /// frames freed.
    pub fn release_range<A: FrameAllocator + ?Sized>(
        &mut self,
        start: VirtAddr,
        len: PageLen,
        frames: &mut A,
    ) -> Result<usize, MapError> {
        self.check_range(start, len)?;
        let mut freed = 0;
        let end = start.end_of(len);
        let mut cursor = start.raw() as u64;
        while cursor < end {
            let va = VirtAddr::new(cursor as u32);
            let slot_end = ((cursor / PDE_SPAN) + 1) * PDE_SPAN;
            if self.tables[va.pdx()].is_none() {
                cursor = slot_end;
                continue;
            }
            if let Some(pa) = self.unmap_page(va) {
                frames.free(pa);
                freed += 1;
            }
            cursor += PAGE_SIZE as u64;
        }
        Ok(freed)
    }

    /// Drops every table touched by `[start, start + len)` that has no present leaf
    /// and whose span `keep` does not claim. `keep` is handed the 4 MiB span each
    /// table covers. Returns the number of tables dropped.
    pub fn reclaim_tables(
        &mut self,
        start: VirtAddr,
        len: PageLen,
        mut keep: impl FnMut(VirtAddr, PageLen) -> bool,
    ) -> usize {
        let Some(span) = PageLen::from_bytes_aligned(PDE_SPAN as u32) else {
            return 0;
        };
        if self.check_range(start, len).is_err() {
            return 0;
        }
        let mut dropped = 0;
        for slot in Self::slots(start, len) {
            let empty = self.tables[slot].as_ref().map_or(false, |table| table.present_count() == 0);
            let span_start = VirtAddr::new((slot as u64 * PDE_SPAN) as u32);
            if empty && !keep(span_start, span) {
                self.tables[slot] = None;
                self.table_count -= 1;
                dropped += 1;
            }
        }
        dropped
    }

    /// Frees every user frame and every second-level table. Returns the number of
    /// frames freed.
    pub fn free_all<A: FrameAllocator + ?Sized>(&mut self, frames: &mut A) -> usize {
        let mut freed = 0;
        for slot in self.tables.iter_mut() {
            if let Some(table) = slot.take() {
                for pte in table.entries.iter().filter(|pte| pte.is_present()) {
                    frames.free(pte.addr());
                    freed += 1;
                }
            }
        }
        self.table_count = 0;
        freed
    }

    /// Number of present leaves across the whole directory.
    pub fn present_pages(&self) -> usize {
        self.tables.iter().flatten().map(|table| table.present_count()).sum()
    }
}
