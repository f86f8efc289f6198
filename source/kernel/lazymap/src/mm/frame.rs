// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, FramePool, JUNK_BYTE
//! DEPENDS_ON: types::PhysAddr
//! INVARIANTS: A frame is either on the free list or handed out, never both;
//!             freed frames are filled with JUNK_BYTE

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use super::PAGE_SIZE;
use crate::types::PhysAddr;

/// Byte pattern written over freed frames so stale references read garbage.
pub const JUNK_BYTE: u8 = 0x05;

/// First physical address handed out by [`FramePool`].
const POOL_BASE: u32 = 0x0010_0000;

/// Largest pool whose frames all have 32-bit physical addresses.
pub const MAX_POOL_FRAMES: usize = (u32::MAX - POOL_BASE) as usize / PAGE_SIZE + 1;

/// Contents of one physical frame.
pub type Frame = [u8; PAGE_SIZE];

/// Single-page physical allocator used by the fault path and teardown.
pub trait FrameAllocator {
    /// Takes one frame off the free list. Contents are unspecified.
    fn alloc(&mut self) -> Option<PhysAddr>;

    /// Returns a frame to the free list.
    fn free(&mut self, pa: PhysAddr);

    /// Immutable view of an allocated frame.
    fn frame(&self, pa: PhysAddr) -> Option<&Frame>;

    /// Mutable view of an allocated frame.
    fn frame_mut(&mut self, pa: PhysAddr) -> Option<&mut Frame>;

    /// Number of frames currently on the free list.
    fn free_count(&self) -> usize;

    /// Fills an allocated frame with zeroes. Returns `false` for foreign addresses.
    fn zero(&mut self, pa: PhysAddr) -> bool {
        match self.frame_mut(pa) {
            Some(frame) => {
                frame.fill(0);
                true
            }
            None => false,
        }
    }
}

/// Bounded pool of host-backed frames starting at a fixed physical base.
///
/// Backing storage for a frame is created on its first allocation and kept for
/// reuse, so an idle pool costs only its bookkeeping.
pub struct FramePool {
    storage: Vec<Option<Box<Frame>>>,
    allocated: Vec<bool>,
    free_list: Vec<u32>,
}

impl FramePool {
    /// Creates a pool of `frames` free frames, capped at [`MAX_POOL_FRAMES`].
    pub fn new(frames: usize) -> Self {
        if frames > MAX_POOL_FRAMES {
            log::warn!(target: "mm", "frame pool of {} capped at {}", frames, MAX_POOL_FRAMES);
        }
        let frames = frames.min(MAX_POOL_FRAMES);
        let mut storage = Vec::with_capacity(frames);
        storage.resize_with(frames, || None);
        // Reverse so the lowest address is handed out first.
        let free_list = (0..frames as u32).rev().collect();
        Self { storage, allocated: alloc::vec![false; frames], free_list }
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns `true` when `pa` is currently handed out.
    pub fn is_allocated(&self, pa: PhysAddr) -> bool {
        self.index_of(pa).map_or(false, |idx| self.allocated[idx])
    }

    fn index_of(&self, pa: PhysAddr) -> Option<usize> {
        if !pa.is_page_aligned() || pa.raw() < POOL_BASE {
            return None;
        }
        let idx = ((pa.raw() - POOL_BASE) as usize) / PAGE_SIZE;
        (idx < self.storage.len()).then_some(idx)
    }

    fn addr_of(idx: u32) -> PhysAddr {
        PhysAddr::new(POOL_BASE + idx * PAGE_SIZE as u32)
    }
}

impl FrameAllocator for FramePool {
    fn alloc(&mut self) -> Option<PhysAddr> {
        let idx = self.free_list.pop()?;
        let slot = &mut self.storage[idx as usize];
        if slot.is_none() {
            *slot = Some(Box::new([JUNK_BYTE; PAGE_SIZE]));
        }
        self.allocated[idx as usize] = true;
        log::trace!(target: "mm", "frame alloc {}", Self::addr_of(idx));
        Some(Self::addr_of(idx))
    }

    fn free(&mut self, pa: PhysAddr) {
        let Some(idx) = self.index_of(pa) else {
            log::error!(target: "mm", "free of foreign frame {}", pa);
            return;
        };
        if !self.allocated[idx] {
            log::error!(target: "mm", "double free of frame {}", pa);
            return;
        }
        if let Some(frame) = self.storage[idx].as_deref_mut() {
            frame.fill(JUNK_BYTE);
        }
        self.allocated[idx] = false;
        self.free_list.push(idx as u32);
        log::trace!(target: "mm", "frame free {}", pa);
    }

    fn frame(&self, pa: PhysAddr) -> Option<&Frame> {
        let idx = self.index_of(pa)?;
        if !self.allocated[idx] {
            return None;
        }
        self.storage[idx].as_deref()
    }

    fn frame_mut(&mut self, pa: PhysAddr) -> Option<&mut Frame> {
        let idx = self.index_of(pa)?;
        if !self.allocated[idx] {
            return None;
        }
        self.storage[idx].as_deref_mut()
    }

    fn free_count(&self) -> usize {
        self.free_list.len()
    }
}
