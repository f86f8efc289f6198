// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process list of mapping-region descriptors
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Region, RegionId, RegionList (insert/remove/find/destroy_all/iter)
//! DEPENDS_ON: types::{VirtAddr, PageLen}, lazymap_abi::{Prot, MapFlags}
//! INVARIANTS: Arena slots form one circular doubly-linked ring; insert/remove are O(1);
//!             a stale RegionId never resolves after its slot is reused

extern crate alloc;

use alloc::vec::Vec;
use core::num::NonZeroU32;

use lazymap_abi::{MapFlags, Prot};

use crate::types::{PageLen, VirtAddr};

/// Descriptor of one live mapping. Never mutated after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    start: VirtAddr,
    hint: VirtAddr,
    len: PageLen,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    offset: u32,
}

impl Region {
    pub const fn new(
        start: VirtAddr,
        hint: VirtAddr,
        len: PageLen,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: u32,
    ) -> Self {
        Self { start, hint, len, prot, flags, fd, offset }
    }

    #[inline]
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    /// Hint originally passed by the caller, kept for diagnostics.
    #[inline]
    pub const fn hint(&self) -> VirtAddr {
        self.hint
    }

    #[inline]
    pub const fn len(&self) -> PageLen {
        self.len
    }

    #[inline]
    pub const fn prot(&self) -> Prot {
        self.prot
    }

    #[inline]
    pub const fn flags(&self) -> MapFlags {
        self.flags
    }

    #[inline]
    pub const fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Exclusive end address, widened so a region ending at 4 GiB is representable.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.start.end_of(self.len)
    }

    #[inline]
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start && (va.raw() as u64) < self.end()
    }

    /// Returns `true` when `[start, start + len)` shares at least one byte with this region.
    #[inline]
    pub fn overlaps(&self, start: VirtAddr, len: PageLen) -> bool {
        (start.raw() as u64) < self.end() && start.end_of(len) > self.start.raw() as u64
    }
}

/// Stable handle to a slot in a [`RegionList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId {
    slot: NonZeroU32,
    generation: u32,
}

impl RegionId {
    fn new(index: usize, generation: u32) -> Self {
        Self { slot: NonZeroU32::MIN.saturating_add(index as u32), generation }
    }

    fn index(self) -> usize {
        self.slot.get() as usize - 1
    }
}

struct Node {
    region: Option<Region>,
    prev: usize,
    next: usize,
    generation: u32,
}

/// Owning arena of region descriptors threaded into a circular ring.
///
/// Sibling order is insertion order but callers must not rely on it.
#[derive(Default)]
pub struct RegionList {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    head: Option<usize>,
    len: usize,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { nodes: Vec::new(), vacant: Vec::new(), head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `region` and returns its handle.
    pub fn insert(&mut self, region: Region) -> RegionId {
        let idx = match self.vacant.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(Node { region: None, prev: 0, next: 0, generation: 0 });
                self.nodes.len() - 1
            }
        };
        let (prev, next) = match self.head {
            None => {
                self.head = Some(idx);
                (idx, idx)
            }
            Some(head) => {
                let tail = self.nodes[head].prev;
                self.nodes[tail].next = idx;
                self.nodes[head].prev = idx;
                (tail, head)
            }
        };
        let node = &mut self.nodes[idx];
        node.region = Some(region);
        node.prev = prev;
        node.next = next;
        self.len += 1;
        RegionId::new(idx, node.generation)
    }

    fn live_index(&self, id: RegionId) -> Option<usize> {
        let idx = id.index();
        let node = self.nodes.get(idx)?;
        (node.generation == id.generation && node.region.is_some()).then_some(idx)
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.live_index(id).and_then(|idx| self.nodes[idx].region.as_ref())
    }

    /// Unlinks the region behind `id` and hands it back. Stale handles yield `None`.
    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        let idx = self.live_index(id)?;
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if next == idx {
            self.head = None;
        } else {
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
            if self.head == Some(idx) {
                self.head = Some(next);
            }
        }
        let node = &mut self.nodes[idx];
        node.generation = node.generation.wrapping_add(1);
        let region = node.region.take();
        self.vacant.push(idx);
        self.len -= 1;
        region
    }

    /// Linear scan for the first region satisfying `pred`.
    pub fn find(&self, mut pred: impl FnMut(&Region) -> bool) -> Option<RegionId> {
        self.iter().find(|(_, region)| pred(region)).map(|(id, _)| id)
    }

    /// Region whose start is exactly `va`.
    pub fn find_start(&self, va: VirtAddr) -> Option<RegionId> {
        self.find(|region| region.start() == va)
    }

    /// Region containing `va`.
    pub fn find_containing(&self, va: VirtAddr) -> Option<RegionId> {
        self.find(|region| region.contains(va))
    }

    /// Returns `true` when any live region overlaps `[start, start + len)`.
    pub fn any_overlap(&self, start: VirtAddr, len: PageLen) -> bool {
        self.iter().any(|(_, region)| region.overlaps(start, len))
    }

    /// Pops and frees every descriptor. Returns how many were freed.
    ///
    /// Slots stay allocated with their generations bumped, so handles taken before
    /// teardown never resolve to a later region.
    pub fn destroy_all(&mut self) -> usize {
        let mut freed = 0;
        while let Some(head) = self.head {
            let id = RegionId::new(head, self.nodes[head].generation);
            if self.remove(id).is_some() {
                freed += 1;
            } else {
                break;
            }
        }
        freed
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cursor: self.head, remaining: self.len }
    }
}

/// Ring walk from the head, visiting each live region once.
pub struct Iter<'a> {
    list: &'a RegionList,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (RegionId, &'a Region);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.cursor?;
        let node = &self.list.nodes[idx];
        self.remaining -= 1;
        self.cursor = Some(node.next);
        let region = node.region.as_ref()?;
        Some((RegionId::new(idx, node.generation), region))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
