// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and lifecycle hooks for the mapping core
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (spawn/exit/reap) + tests/ end-to-end scenarios
//! PUBLIC API: ProcessTable (spawn/exit/reap), Process, ProcState, on_process_create, on_process_destroy
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}, trap::TrapFrame, types::Pid
//! INVARIANTS: PID 0 is never used; an exited process owns no frames and no regions;
//!             a zombie is never scheduled or mutated until reaped

extern crate alloc;

use alloc::{string::String, vec::Vec};

use crate::config::VmConfig;
use crate::mm::{AddressSpace, FrameAllocator, MapError, PteFlags, PAGE_SIZE};
use crate::trap::TrapFrame;
use crate::types::VirtAddr;

pub use crate::types::Pid;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Runnable,
    Zombie,
}

/// Error returned when spawning a new process.
#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    /// No frame left for the user image.
    #[error("out of frames for the user image")]
    OutOfFrames,
    /// Installing the user image failed.
    #[error("mapping the user image failed: {0}")]
    Mapping(#[from] MapError),
}

/// Error returned by lifecycle operations on an existing process.
#[must_use = "process errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),
    #[error("process {0} has not exited")]
    NotZombie(Pid),
}

/// Minimal process control block.
pub struct Process {
    pid: Pid,
    name: String,
    state: ProcState,
    killed: bool,
    space: AddressSpace,
    /// Size of the eagerly mapped user image in bytes.
    sz: u32,
    frame: TrapFrame,
    faults: u64,
}

impl Process {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ProcState {
        self.state
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Marks the process for termination; it exits on its next trap return.
    pub fn kill(&mut self) {
        self.killed = true;
    }

    #[inline]
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    #[inline]
    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    /// End of the user image; addresses below it hold text, data and the stack.
    #[inline]
    pub fn image_size(&self) -> u32 {
        self.sz
    }

    #[inline]
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    #[inline]
    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    /// Page faults delivered to this process so far.
    #[inline]
    pub fn fault_count(&self) -> u64 {
        self.faults
    }

    pub(crate) fn record_fault(&mut self) {
        self.faults += 1;
    }
}

/// Fresh process: no mapping regions yet.
pub fn on_process_create(proc: &mut Process) {
    proc.space.reset_regions();
}

/// Frees every remaining region descriptor. Backing frames go with the address space.
pub fn on_process_destroy(proc: &mut Process) -> usize {
    proc.space.destroy_regions()
}

/// Table of every process, indexed by PID.
pub struct ProcessTable {
    procs: Vec<Option<Process>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self { procs: Vec::new() }
    }

    /// Number of processes, zombies included.
    pub fn len(&self) -> usize {
        self.procs.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(pid: Pid) -> Option<usize> {
        (pid.as_raw() as usize).checked_sub(1)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(Self::slot(pid)?)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(Self::slot(pid)?)?.as_mut()
    }

    /// Creates a process with an eagerly mapped, zeroed user image of
    /// `config.image_pages()` pages starting at address 0. The stack grows down from
    /// the end of the image.
    pub fn spawn<A: FrameAllocator + ?Sized>(
        &mut self,
        name: &str,
        config: VmConfig,
        frames: &mut A,
    ) -> Result<Pid, SpawnError> {
        let pid = Pid::from_raw(self.procs.len() as u32 + 1);
        let mut space = AddressSpace::new(config);
        if let Err(err) = map_image(&mut space, config.image_pages(), frames) {
            space.release(frames);
            log::warn!(target: "proc", "spawn of {} failed: {}", name, err);
            return Err(err);
        }
        let sz = (config.image_pages() * PAGE_SIZE) as u32;
        let mut proc = Process {
            pid,
            name: String::from(name),
            state: ProcState::Runnable,
            killed: false,
            space,
            sz,
            frame: TrapFrame::user(0, sz),
            faults: 0,
        };
        on_process_create(&mut proc);
        self.procs.push(Some(proc));
        log::debug!(target: "proc", "spawned pid {} ({}) image={:#x}", pid, name, sz);
        Ok(pid)
    }

    /// Tears the process down: regions, frames and page tables. It stays a zombie
    /// until [`Self::reap`]. Exiting a zombie again is a no-op.
    pub fn exit<A: FrameAllocator + ?Sized>(&mut self, pid: Pid, frames: &mut A) -> Result<(), ProcError> {
        let proc = self.get_mut(pid).ok_or(ProcError::NoSuchProcess(pid))?;
        if proc.state == ProcState::Zombie {
            return Ok(());
        }
        let regions = on_process_destroy(proc);
        let pages = proc.space.release(frames);
        proc.state = ProcState::Zombie;
        proc.frame = TrapFrame::default();
        log::debug!(
            target: "proc",
            "pid {} ({}) exited: {} regions, {} frames released",
            pid,
            proc.name,
            regions,
            pages
        );
        Ok(())
    }

    /// Removes a zombie from the table.
    pub fn reap(&mut self, pid: Pid) -> Result<Process, ProcError> {
        let slot = Self::slot(pid).ok_or(ProcError::NoSuchProcess(pid))?;
        let entry = self.procs.get_mut(slot).ok_or(ProcError::NoSuchProcess(pid))?;
        match entry.as_ref().map(Process::state) {
            Some(ProcState::Zombie) => entry.take().ok_or(ProcError::NoSuchProcess(pid)),
            Some(ProcState::Runnable) => Err(ProcError::NotZombie(pid)),
            None => Err(ProcError::NoSuchProcess(pid)),
        }
    }
}

fn map_image<A: FrameAllocator + ?Sized>(
    space: &mut AddressSpace,
    pages: usize,
    frames: &mut A,
) -> Result<(), SpawnError> {
    let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
    for page in 0..pages {
        let va = VirtAddr::new((page * PAGE_SIZE) as u32);
        let pa = frames.alloc().ok_or(SpawnError::OutOfFrames)?;
        if !frames.zero(pa) {
            frames.free(pa);
            return Err(SpawnError::OutOfFrames);
        }
        if let Err(err) = space.page_directory_mut().map_page(va, pa, flags) {
            frames.free(pa);
            return Err(err.into());
        }
    }
    Ok(())
}
