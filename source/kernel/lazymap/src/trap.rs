// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap handling: interrupt descriptor table, tick counter and the dispatch core
//! that routes system calls, page faults and timer interrupts.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::mm::{handle_page_fault, FaultError, FrameAllocator, PageFaultCode};
use crate::syscall::{api, Args, SyscallTable};
use crate::task::Process;
use crate::types::VirtAddr;

// --- vectors ---

pub const T_DIVIDE: u32 = 0;
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6;
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACK: u32 = 12;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_FPERR: u32 = 16;
pub const T_ALIGN: u32 = 17;
pub const T_MCHK: u32 = 18;
pub const T_SIMDERR: u32 = 19;
/// System-call vector; the only gate user code may raise.
pub const T_SYSCALL: u32 = 64;
/// First hardware IRQ vector.
pub const T_IRQ0: u32 = 32;
pub const IRQ_TIMER: u32 = 0;

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 1 << 3;
/// User code segment selector (GDT slot 3, RPL 3).
pub const USER_CS: u16 = (3 << 3) | DPL_USER as u16;
pub const DPL_USER: u8 = 3;
pub const DPL_KERNEL: u8 = 0;

const IDT_ENTRIES: usize = 256;

/// Register state saved on entry to the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub trapno: u32,
    pub err: u32,
    /// Faulting address for page faults.
    pub cr2: u32,
    pub cs: u16,
    pub eip: u32,
    pub esp: u32,
    /// Syscall number in, return value out.
    pub eax: u32,
}

impl TrapFrame {
    /// Initial user-mode frame.
    pub const fn user(eip: u32, esp: u32) -> Self {
        Self { trapno: 0, err: 0, cr2: 0, cs: USER_CS, eip, esp, eax: 0 }
    }

    /// Returns `true` when the trap came from user mode.
    #[inline]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == DPL_USER as u16
    }
}

// --- interrupt descriptor table ---

/// One interrupt gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gate {
    /// Lowest privilege level allowed to raise this vector with `int`.
    pub dpl: u8,
    /// Trap gates leave interrupts enabled on entry.
    pub is_trap: bool,
}

pub struct Idt {
    gates: [Gate; IDT_ENTRIES],
}

impl Idt {
    fn build() -> Self {
        let mut gates = [Gate { dpl: DPL_KERNEL, is_trap: false }; IDT_ENTRIES];
        gates[T_SYSCALL as usize] = Gate { dpl: DPL_USER, is_trap: true };
        Self { gates }
    }

    pub fn gate(&self, vector: u32) -> Option<&Gate> {
        self.gates.get(vector as usize)
    }
}

static IDT: Once<Idt> = Once::new();
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Builds the descriptor table on first use and returns it.
pub fn tvinit() -> &'static Idt {
    IDT.call_once(|| {
        log::debug!(target: "trap", "idt: {} gates, syscall vector {}", IDT_ENTRIES, T_SYSCALL);
        Idt::build()
    })
}

/// Descriptor table, if [`tvinit`] has run.
pub fn idt() -> Option<&'static Idt> {
    IDT.get()
}

/// Timer ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

// --- diagnostics ---

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
}

/// Most recent frame seen by [`trap`].
pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

pub fn describe_trap(trapno: u32) -> &'static str {
    match trapno {
        T_DIVIDE => "Divide error",
        T_DEBUG => "Debug",
        T_NMI => "Non-Maskable Interrupt",
        T_BRKPT => "Breakpoint",
        T_OFLOW => "Overflow",
        T_BOUND => "BOUND Range Exceeded",
        T_ILLOP => "Invalid Opcode",
        T_DEVICE => "Device Not Available",
        T_DBLFLT => "Double Fault",
        9 => "Coprocessor Segment Overrun",
        T_TSS => "Invalid TSS",
        T_SEGNP => "Segment Not Present",
        T_STACK => "Stack Fault",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_FPERR => "x87 FPU Floating-Point Error",
        T_ALIGN => "Alignment Check",
        T_MCHK => "Machine-Check",
        T_SIMDERR => "SIMD Floating-Point Exception",
        T_SYSCALL => "System call",
        v if v == T_IRQ0 + IRQ_TIMER => "Timer interrupt",
        v if (T_IRQ0..T_IRQ0 + 16).contains(&v) => "Hardware interrupt",
        _ => "(unknown trap)",
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, "trap {} ({}) err={:#x}", frame.trapno, describe_trap(frame.trapno), frame.err)?;
    writeln!(
        f,
        " cs={:#06x} eip={:#010x} esp={:#010x} eax={:#010x} cr2={:#010x}",
        frame.cs, frame.eip, frame.esp, frame.eax, frame.cr2
    )
}

// --- dispatch ---

/// What the caller should do with the trapping process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapExit {
    /// Return to the process.
    Resume,
    /// The process is killed; tear it down instead of returning.
    Exit,
    /// Unexpected trap while in kernel mode.
    KernelFault { trapno: u32, eip: u32 },
}

/// Handles the trap recorded in `proc`'s frame.
pub fn trap(proc: &mut Process, frames: &mut dyn FrameAllocator, syscalls: &SyscallTable) -> TrapExit {
    let frame = *proc.frame();
    record(&frame);

    match frame.trapno {
        T_SYSCALL => {
            if proc.is_killed() {
                return TrapExit::Exit;
            }
            let args = Args::new(frame.esp);
            let ret = {
                let mut ctx = api::Context::new(proc, frames);
                syscalls.dispatch(frame.eax, &mut ctx, &args)
            };
            proc.frame_mut().eax = match ret {
                Ok(value) => value,
                Err(err) => {
                    log::debug!(target: "trap", "pid {}: syscall {} -> {}", proc.pid(), frame.eax, err);
                    err.to_ret()
                }
            };
            if proc.is_killed() {
                return TrapExit::Exit;
            }
        }
        T_PGFLT => {
            proc.record_fault();
            let va = VirtAddr::new(frame.cr2);
            let code = PageFaultCode::from_bits_truncate(frame.err);
            if let Err(err) = handle_page_fault(proc.address_space_mut(), frames, va, code) {
                kill_on_fault(proc, &frame, err);
            }
        }
        v if v == T_IRQ0 + IRQ_TIMER => {
            TICKS.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            if !frame.from_user() {
                log::error!(
                    target: "trap",
                    "unexpected trap {} ({}) from kernel eip={:#x} cr2={:#x}",
                    frame.trapno,
                    describe_trap(frame.trapno),
                    frame.eip,
                    frame.cr2
                );
                return TrapExit::KernelFault { trapno: frame.trapno, eip: frame.eip };
            }
            log::warn!(
                target: "trap",
                "pid {} {}: trap {} ({}) err {} eip {:#x} addr {:#x}--kill proc",
                proc.pid(),
                proc.name(),
                frame.trapno,
                describe_trap(frame.trapno),
                frame.err,
                frame.eip,
                frame.cr2
            );
            proc.kill();
        }
    }

    if proc.is_killed() && frame.from_user() {
        return TrapExit::Exit;
    }
    TrapExit::Resume
}

fn kill_on_fault(proc: &mut Process, frame: &TrapFrame, err: FaultError) {
    log::warn!(
        target: "pf",
        "pid {} {}: page fault err {} eip {:#x}: {}--kill proc",
        proc.pid(),
        proc.name(),
        frame.err,
        frame.eip,
        err
    );
    proc.kill();
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::string::String;

    use super::*;
    use crate::config::VmConfig;
    use crate::mm::{FramePool, MmapRequest, Prot};
    use crate::task::ProcessTable;

    fn one_process() -> (ProcessTable, FramePool, crate::types::Pid) {
        let mut pool = FramePool::new(8);
        let mut table = ProcessTable::new();
        let pid = table.spawn("t", VmConfig::new(), &mut pool).unwrap();
        (table, pool, pid)
    }

    #[test]
    fn idt_only_opens_the_syscall_gate_to_user() {
        let idt = tvinit();
        assert_eq!(idt.gate(T_SYSCALL).map(|g| g.dpl), Some(DPL_USER));
        assert_eq!(idt.gate(T_PGFLT).map(|g| g.dpl), Some(DPL_KERNEL));
        assert_eq!(idt.gate(T_IRQ0).map(|g| g.dpl), Some(DPL_KERNEL));
        assert!(idt.gate(256).is_none());
        assert!(core::ptr::eq(idt, tvinit()));
    }

    #[test]
    fn timer_interrupt_advances_ticks() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        proc.frame_mut().trapno = T_IRQ0 + IRQ_TIMER;
        let before = ticks();
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Resume);
        assert!(ticks() > before);
    }

    #[test]
    fn user_page_fault_inside_region_resumes() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let req = MmapRequest::anonymous(VirtAddr::new(0), 4096, Prot::RW);
        let addr = proc.address_space_mut().mmap(&req).unwrap();
        let frame = proc.frame_mut();
        frame.trapno = T_PGFLT;
        frame.err = (PageFaultCode::USER | PageFaultCode::WRITE).bits();
        frame.cr2 = addr.raw() + 8;
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Resume);
        assert!(proc.address_space().page_directory().is_present(addr));
        assert_eq!(proc.fault_count(), 1);
    }

    #[test]
    fn user_page_fault_outside_region_kills() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let frame = proc.frame_mut();
        frame.trapno = T_PGFLT;
        frame.err = PageFaultCode::USER.bits();
        frame.cr2 = 0x5000_0000;
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Exit);
        assert!(proc.is_killed());
    }

    #[test]
    fn other_user_traps_kill_and_kernel_traps_report() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        proc.frame_mut().trapno = T_ILLOP;
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Exit);

        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        *proc.frame_mut() = TrapFrame { trapno: T_DIVIDE, cs: KERNEL_CS, eip: 0x8010_0000, ..TrapFrame::default() };
        assert_eq!(
            trap(proc, &mut pool, &SyscallTable::new()),
            TrapExit::KernelFault { trapno: T_DIVIDE, eip: 0x8010_0000 }
        );
        assert!(!proc.is_killed());
    }

    #[test]
    fn killed_process_exits_before_running_a_syscall() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        proc.kill();
        proc.frame_mut().trapno = T_SYSCALL;
        proc.frame_mut().eax = 0xdead;
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Exit);
        assert_eq!(proc.frame().eax, 0xdead);
    }

    #[test]
    fn unknown_syscall_returns_enosys() {
        let (mut table, mut pool, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        proc.frame_mut().trapno = T_SYSCALL;
        proc.frame_mut().eax = 9;
        assert_eq!(trap(proc, &mut pool, &SyscallTable::new()), TrapExit::Resume);
        assert_eq!(proc.frame().eax as i32, lazymap_abi::Errno::NotImplemented.as_neg());
    }

    #[test]
    fn describe_and_format() {
        assert_eq!(describe_trap(T_PGFLT), "Page Fault");
        assert_eq!(describe_trap(T_IRQ0), "Timer interrupt");
        assert_eq!(describe_trap(T_IRQ0 + 5), "Hardware interrupt");
        assert_eq!(describe_trap(200), "(unknown trap)");
        let frame = TrapFrame { trapno: T_PGFLT, cr2: 0x4000_0000, ..TrapFrame::user(0x10, 0x2000) };
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("Page Fault"));
        assert!(out.contains("cr2=0x40000000"));
        record(&frame);
        assert!(last_trap().is_some());
    }
}
