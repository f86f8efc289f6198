// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for 32-bit addresses, page-rounded lengths and process ids
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, PageLen, Pid
//! DEPENDS_ON: mm::PAGE_SIZE
//! INVARIANTS: Addresses are 32-bit; PageLen is non-zero and page-aligned; helpers never wrap

use core::fmt;

use crate::mm::{PAGE_SHIFT, PAGE_SIZE};

const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;

/// A user or kernel virtual address in the flat 32-bit space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Wraps a raw address.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Wraps `raw` only if it is page aligned.
    #[inline]
    pub const fn page_aligned(raw: u32) -> Option<Self> {
        if raw & PAGE_MASK == 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Rounds up to the next page boundary, or `None` past the end of the space.
    #[inline]
    pub fn page_ceil(self) -> Option<Self> {
        self.0.checked_add(PAGE_MASK).map(|v| Self(v & !PAGE_MASK))
    }

    /// Byte offset inside the containing page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Page-directory index (bits 31..22).
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> 22) as usize & 0x3ff
    }

    /// Page-table index (bits 21..12).
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize & 0x3ff
    }

    /// Adds `len` bytes, failing on 32-bit overflow.
    #[inline]
    pub fn checked_add(self, len: u32) -> Option<Self> {
        self.0.checked_add(len).map(Self)
    }

    /// End address of `[self, self + len)` widened to 64 bits so that a range ending at
    /// 4 GiB is representable.
    #[inline]
    pub const fn end_of(self, len: PageLen) -> u64 {
        self.0 as u64 + len.bytes() as u64
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// A physical frame address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pa:0x{:08x}", self.0)
    }
}

/// A non-zero byte length that is a whole number of pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageLen(u32);

impl PageLen {
    /// Accepts an already page-aligned, non-zero byte count.
    #[inline]
    pub const fn from_bytes_aligned(bytes: u32) -> Option<Self> {
        if bytes == 0 || bytes & PAGE_MASK != 0 {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Rounds a caller-supplied signed length up to whole pages.
    ///
    /// Non-positive lengths and lengths that overflow the 32-bit space are rejected.
    #[inline]
    pub fn from_request(len: i32) -> Option<Self> {
        if len <= 0 {
            return None;
        }
        (len as u32).checked_add(PAGE_MASK).map(|v| Self(v & !PAGE_MASK))
    }

    /// Exactly `count` pages.
    #[inline]
    pub fn from_pages(count: u32) -> Option<Self> {
        if count == 0 {
            return None;
        }
        count.checked_mul(PAGE_SIZE as u32).map(Self)
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn pages(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }
}

/// Process identifier.
///
/// **Invariant**: PID 0 is never handed out; the first process is PID 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
