// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side kernel facade tying processes, frames and the trap path together
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (spawn/syscall/user_read/user_write/exit/reap/timer_interrupt), KernelError
//! DEPENDS_ON: task::ProcessTable, mm::FramePool, syscall::SyscallTable, trap
//! INVARIANTS: Every user access goes through the software MMU; faults are delivered via
//!             trap(); a process whose trap returns Exit is torn down before control returns

use crate::config::VmConfig;
use crate::mm::{FrameAllocator, FramePool, PageFaultCode, PteFlags, PAGE_SIZE};
use crate::syscall::{api, SyscallTable};
use crate::task::{Pid, ProcError, ProcState, Process, ProcessTable, SpawnError};
use crate::trap::{self, TrapExit, TrapFrame, DPL_USER, T_GPFLT, T_IRQ0, T_PGFLT, T_SYSCALL, IRQ_TIMER};
use crate::types::{PhysAddr, VirtAddr};

/// Errors surfaced to the caller driving the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no runnable process with pid {0}")]
    NoSuchProcess(Pid),
    /// The process was killed and has been torn down.
    #[error("process {0} was killed")]
    Killed(Pid),
    #[error("unexpected kernel trap {trapno} at eip {eip:#x}")]
    KernelFault { trapno: u32, eip: u32 },
    /// A fault was resolved but the retried access faulted again.
    #[error("access to {0} still faults after resolution")]
    Unresolved(VirtAddr),
    #[error("too many syscall arguments: {0}")]
    TooManyArgs(usize),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Process(#[from] ProcError),
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write(u8),
}

/// Single-CPU kernel instance.
pub struct Kernel {
    config: VmConfig,
    frames: FramePool,
    procs: ProcessTable,
    syscalls: SyscallTable,
}

impl Kernel {
    pub fn new(config: VmConfig) -> Self {
        trap::tvinit();
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        log::debug!(
            target: "proc",
            "kernel up: zone [{}, {}) frames={}",
            config.mmap_base(),
            config.kernel_base(),
            config.phys_frames()
        );
        Self { frames: FramePool::new(config.phys_frames()), procs: ProcessTable::new(), syscalls, config }
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid)
    }

    /// Page faults delivered to `pid` so far.
    pub fn fault_count(&self, pid: Pid) -> Option<u64> {
        self.procs.get(pid).map(Process::fault_count)
    }

    pub fn spawn(&mut self, name: &str) -> Result<Pid, KernelError> {
        Ok(self.procs.spawn(name, self.config, &mut self.frames)?)
    }

    fn runnable(procs: &mut ProcessTable, pid: Pid) -> Result<&mut Process, KernelError> {
        procs
            .get_mut(pid)
            .filter(|proc| proc.state() == ProcState::Runnable)
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    /// Raises the trap already recorded in `pid`'s frame and acts on the outcome.
    fn deliver(&mut self, pid: Pid) -> Result<(), KernelError> {
        let proc = Self::runnable(&mut self.procs, pid)?;
        let exit = trap::trap(proc, &mut self.frames, &self.syscalls);
        let killed = proc.is_killed();
        match exit {
            TrapExit::KernelFault { trapno, eip } => Err(KernelError::KernelFault { trapno, eip }),
            TrapExit::Exit => {
                self.exit(pid)?;
                Err(KernelError::Killed(pid))
            }
            TrapExit::Resume if killed => {
                self.exit(pid)?;
                Err(KernelError::Killed(pid))
            }
            TrapExit::Resume => Ok(()),
        }
    }

    /// Issues system call `number` from `pid` with `args` pushed on its user stack.
    ///
    /// Returns the value left in `eax`: a result or a negated errno.
    pub fn syscall(&mut self, pid: Pid, number: u32, args: &[u32]) -> Result<i32, KernelError> {
        let sz = Self::runnable(&mut self.procs, pid)?.image_size();
        let words = args.len() as u32 + 1;
        let esp = words
            .checked_mul(4)
            .and_then(|bytes| sz.checked_sub(bytes))
            .filter(|&esp| (esp as usize) >= sz as usize - PAGE_SIZE)
            .ok_or(KernelError::TooManyArgs(args.len()))?;
        self.store_word(pid, esp, u32::MAX)?;
        for (i, word) in args.iter().enumerate() {
            self.store_word(pid, esp + 4 + 4 * i as u32, *word)?;
        }
        let proc = Self::runnable(&mut self.procs, pid)?;
        let frame = TrapFrame { trapno: T_SYSCALL, esp, eax: number, ..*proc.frame() };
        *proc.frame_mut() = frame;
        self.deliver(pid)?;
        let ret = Self::runnable(&mut self.procs, pid)?.frame().eax as i32;
        Ok(ret)
    }

    /// Simulates a user `int vector` instruction.
    ///
    /// Vectors whose gate is kernel-only raise a general-protection fault instead.
    pub fn user_interrupt(&mut self, pid: Pid, vector: u32) -> Result<(), KernelError> {
        let allowed = trap::tvinit().gate(vector).map_or(false, |gate| gate.dpl >= DPL_USER);
        let frame = Self::runnable(&mut self.procs, pid)?.frame_mut();
        if allowed {
            frame.trapno = vector;
        } else {
            frame.trapno = T_GPFLT;
            frame.err = vector << 3 | 2;
        }
        self.deliver(pid)
    }

    /// Delivers a timer interrupt while `pid` is running.
    pub fn timer_interrupt(&mut self, pid: Pid) -> Result<(), KernelError> {
        Self::runnable(&mut self.procs, pid)?.frame_mut().trapno = T_IRQ0 + IRQ_TIMER;
        self.deliver(pid)
    }

    /// Reads one byte from `pid`'s address space as user code would.
    pub fn user_read(&mut self, pid: Pid, va: u32) -> Result<u8, KernelError> {
        self.access(pid, VirtAddr::new(va), Access::Read)
    }

    /// Writes one byte into `pid`'s address space as user code would.
    pub fn user_write(&mut self, pid: Pid, va: u32, value: u8) -> Result<(), KernelError> {
        self.access(pid, VirtAddr::new(va), Access::Write(value)).map(|_| ())
    }

    /// Writes `data` starting at `va`, byte by byte.
    pub fn user_write_bytes(&mut self, pid: Pid, va: u32, data: &[u8]) -> Result<(), KernelError> {
        for (i, byte) in data.iter().enumerate() {
            self.user_write(pid, va.wrapping_add(i as u32), *byte)?;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `va`.
    pub fn user_read_bytes(&mut self, pid: Pid, va: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.user_read(pid, va.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    fn access(&mut self, pid: Pid, va: VirtAddr, access: Access) -> Result<u8, KernelError> {
        for _ in 0..2 {
            let proc = Self::runnable(&mut self.procs, pid)?;
            let code = match mmu_check(proc, va, access) {
                Ok(pa) => return Ok(touch(&mut self.frames, pa, access)),
                Err(code) => code,
            };
            let frame = TrapFrame { trapno: T_PGFLT, err: code.bits(), cr2: va.raw(), ..*proc.frame() };
            *proc.frame_mut() = frame;
            self.deliver(pid)?;
        }
        Err(KernelError::Unresolved(va))
    }

    /// Kernel-side store into the caller's image, used to push syscall arguments.
    fn store_word(&mut self, pid: Pid, addr: u32, word: u32) -> Result<(), KernelError> {
        for (i, byte) in word.to_le_bytes().into_iter().enumerate() {
            let va = VirtAddr::new(addr + i as u32);
            let proc = Self::runnable(&mut self.procs, pid)?;
            let (pa, _) = proc.address_space().translate(va).ok_or(KernelError::Unresolved(va))?;
            touch(&mut self.frames, pa, Access::Write(byte));
        }
        Ok(())
    }

    /// Tears down `pid`; it stays a zombie until [`Self::reap`].
    pub fn exit(&mut self, pid: Pid) -> Result<(), KernelError> {
        Ok(self.procs.exit(pid, &mut self.frames)?)
    }

    pub fn reap(&mut self, pid: Pid) -> Result<(), KernelError> {
        self.procs.reap(pid)?;
        Ok(())
    }
}

fn touch(frames: &mut FramePool, pa: PhysAddr, access: Access) -> u8 {
    let page = PhysAddr::new(pa.raw() & !(PAGE_SIZE as u32 - 1));
    let offset = (pa.raw() as usize) & (PAGE_SIZE - 1);
    match (access, frames.frame_mut(page)) {
        (Access::Write(value), Some(frame)) => {
            frame[offset] = value;
            value
        }
        (Access::Read, Some(frame)) => frame[offset],
        (_, None) => {
            log::error!(target: "mm", "present leaf maps unallocated frame {}", page);
            0
        }
    }
}

/// Software MMU permission check for a user-mode access.
fn mmu_check(proc: &Process, va: VirtAddr, access: Access) -> Result<PhysAddr, PageFaultCode> {
    let mut code = PageFaultCode::USER;
    if matches!(access, Access::Write(_)) {
        code |= PageFaultCode::WRITE;
    }
    let Some((pa, flags)) = proc.address_space().translate(va) else {
        return Err(code);
    };
    let denied = !flags.contains(PteFlags::USER)
        || (code.contains(PageFaultCode::WRITE) && !flags.contains(PteFlags::WRITABLE));
    if denied {
        return Err(code | PageFaultCode::PRESENT);
    }
    Ok(pa)
}
