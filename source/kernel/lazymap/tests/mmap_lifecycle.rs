// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end mapping scenarios driven through syscalls and user accesses
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only
//!
//! TEST_SCENARIOS:
//!   - round_trip_map_touch_unmap(): map, write without a second fault, unmap, touch kills
//!   - map_does_not_consume_frames(): no eager backing
//!   - first_touch_reads_zero(): lazy zero fill
//!   - out_of_region_fault_kills_only_the_offender(): isolation
//!   - exhaustion_is_a_clean_error(): zone full -> ENOMEM, process lives on
//!   - hint_as_offset(): base+hint when free, base when occupied
//!   - exit_reclaims_everything(): frames and regions go with the process
//!   - no_access_region_kills_on_touch(): PROT_NONE is never readable
//!   - map_unmap_cycles_fit_a_small_table_budget(): unmap returns page tables

use lazymap::trap::{T_ILLOP, T_SYSCALL};
use lazymap::{Kernel, KernelError, Pid, VmConfig};
use lazymap_abi::{decode_mmap_ret, decode_status, Errno, MapFlags, Prot, SYS_MMAP, SYS_MUNMAP};

const BASE: u32 = 0x4000_0000;
const BOUNDARY: u32 = 0x8000_0000;
const ANON: u32 = MapFlags::ANONYMOUS.bits();
const RW: u32 = Prot::RW.bits();
const NO_FD: u32 = lazymap_abi::NO_FD as u32;

fn kernel() -> Kernel {
    Kernel::new(VmConfig::new().with_phys_frames(64).unwrap())
}

fn mmap(k: &mut Kernel, pid: Pid, hint: u32, len: u32) -> Result<u32, Errno> {
    let ret = k.syscall(pid, SYS_MMAP, &[hint, len, RW, ANON, NO_FD, 0]).unwrap();
    decode_mmap_ret(ret)
}

fn munmap(k: &mut Kernel, pid: Pid, addr: u32, len: u32) -> Result<(), Errno> {
    decode_status(k.syscall(pid, SYS_MUNMAP, &[addr, len]).unwrap())
}

#[test]
fn round_trip_map_touch_unmap() {
    let mut k = kernel();
    let pid = k.spawn("rt").unwrap();

    let addr = mmap(&mut k, pid, 0, 4096).unwrap();
    assert_eq!(addr, BASE);

    k.user_write(pid, addr, 0x42).unwrap();
    assert_eq!(k.fault_count(pid), Some(1));
    k.user_write(pid, addr + 1, 0x43).unwrap();
    assert_eq!(k.user_read(pid, addr).unwrap(), 0x42);
    assert_eq!(k.fault_count(pid), Some(1));

    assert_eq!(munmap(&mut k, pid, addr, 4096), Ok(()));
    assert!(k.process(pid).unwrap().address_space().regions().is_empty());

    assert_eq!(k.user_write(pid, addr, 1), Err(KernelError::Killed(pid)));
    assert_eq!(k.process(pid).map(|p| p.state()), Some(lazymap::task::ProcState::Zombie));
    assert_eq!(k.syscall(pid, SYS_MMAP, &[0; 6]), Err(KernelError::NoSuchProcess(pid)));
}

#[test]
fn map_does_not_consume_frames() {
    let mut k = kernel();
    let pid = k.spawn("lazy").unwrap();
    let before = k.free_frames();
    for _ in 0..8 {
        mmap(&mut k, pid, 0, 16 * 4096).unwrap();
    }
    assert_eq!(k.free_frames(), before);
    assert_eq!(k.fault_count(pid), Some(0));
}

#[test]
fn first_touch_reads_zero() {
    let mut k = kernel();
    let pid = k.spawn("zero").unwrap();
    let addr = mmap(&mut k, pid, 0, 3 * 4096).unwrap();
    let before = k.free_frames();
    let mut buf = [0xffu8; 16];
    k.user_read_bytes(pid, addr + 4096 + 100, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 16]);
    assert_eq!(k.free_frames(), before - 1);
    assert_eq!(k.fault_count(pid), Some(1));
}

#[test]
fn pages_of_one_region_back_independently() {
    let mut k = kernel();
    let pid = k.spawn("pages").unwrap();
    let addr = mmap(&mut k, pid, 0, 4 * 4096).unwrap();
    k.user_write_bytes(pid, addr + 4096 - 2, b"abcd").unwrap();
    assert_eq!(k.fault_count(pid), Some(2));
    let mut out = [0u8; 4];
    k.user_read_bytes(pid, addr + 4096 - 2, &mut out).unwrap();
    assert_eq!(&out, b"abcd");
    assert_eq!(k.fault_count(pid), Some(2));
}

#[test]
fn out_of_region_fault_kills_only_the_offender() {
    let mut k = kernel();
    let victim = k.spawn("victim").unwrap();
    let bystander = k.spawn("bystander").unwrap();
    let shared_addr = mmap(&mut k, bystander, 0, 4096).unwrap();
    k.user_write(bystander, shared_addr, 7).unwrap();

    assert_eq!(k.user_read(victim, BASE + 0x10_0000), Err(KernelError::Killed(victim)));
    assert_eq!(k.user_read(victim, BASE), Err(KernelError::NoSuchProcess(victim)));

    assert_eq!(k.user_read(bystander, shared_addr), Ok(7));
    assert_eq!(mmap(&mut k, bystander, 0, 4096), Ok(BASE + 4096));
}

#[test]
fn kernel_addresses_are_not_user_accessible() {
    let mut k = kernel();
    let pid = k.spawn("probe").unwrap();
    assert_eq!(k.user_write(pid, BOUNDARY, 1), Err(KernelError::Killed(pid)));
}

#[test]
fn exhaustion_is_a_clean_error() {
    let mut k = kernel();
    let pid = k.spawn("hog").unwrap();
    let len = 256 << 20;
    let slots = (BOUNDARY - BASE) / len;
    assert_eq!(slots, 4);
    let mut addrs: Vec<u32> = (0..slots).map(|_| mmap(&mut k, pid, 0, len).unwrap()).collect();
    addrs.sort_unstable();
    assert_eq!(addrs, [BASE, BASE + len, BASE + 2 * len, BASE + 3 * len]);

    assert_eq!(mmap(&mut k, pid, 0, len), Err(Errno::OutOfMemory));
    assert_eq!(k.process(pid).unwrap().address_space().regions().len(), 4);

    // Still alive and able to reuse space once some is released.
    assert_eq!(munmap(&mut k, pid, BASE + len, len), Ok(()));
    assert_eq!(mmap(&mut k, pid, 0, len), Ok(BASE + len));
}

#[test]
fn invalid_arguments_have_no_side_effects() {
    let mut k = kernel();
    let pid = k.spawn("args").unwrap();
    let ret = k.syscall(pid, SYS_MMAP, &[0, 0, RW, ANON, NO_FD, 0]).unwrap();
    assert_eq!(ret, Errno::InvalidArgument.as_neg());
    let ret = k.syscall(pid, SYS_MMAP, &[0, 4096, RW]).unwrap();
    assert_eq!(ret, Errno::InvalidArgument.as_neg());
    assert_eq!(munmap(&mut k, pid, BASE, 4096), Err(Errno::InvalidArgument));
    assert!(k.process(pid).unwrap().address_space().regions().is_empty());
    assert_eq!(k.process(pid).unwrap().address_space().page_directory().table_count(), 1);
}

#[test]
fn hint_as_offset() {
    let mut k = kernel();
    let pid = k.spawn("hint").unwrap();
    assert_eq!(mmap(&mut k, pid, 4096, 4096), Ok(BASE + 4096));
    assert_eq!(mmap(&mut k, pid, 4096, 4096), Ok(BASE));
    assert_eq!(mmap(&mut k, pid, BASE + 0x20_0000, 4096), Ok(BASE + 0x20_0000));
    assert_eq!(mmap(&mut k, pid, 0xc000_0000, 4096), Ok(BASE + 2 * 4096));
}

#[test]
fn exit_reclaims_everything() {
    let mut k = kernel();
    let idle = k.free_frames();
    let pid = k.spawn("exit").unwrap();
    let addr = mmap(&mut k, pid, 0, 8 * 4096).unwrap();
    for page in 0..5 {
        k.user_write(pid, addr + page * 4096, 1).unwrap();
    }
    assert!(k.free_frames() < idle);
    k.exit(pid).unwrap();
    assert_eq!(k.free_frames(), idle);
    assert!(k.process(pid).unwrap().address_space().regions().is_empty());
    k.reap(pid).unwrap();
    assert!(k.process(pid).is_none());
}

#[test]
fn running_out_of_frames_at_fault_time_kills() {
    let mut k = Kernel::new(VmConfig::new().with_phys_frames(3).unwrap());
    let pid = k.spawn("starved").unwrap();
    let addr = mmap(&mut k, pid, 0, 4 * 4096).unwrap();
    k.user_write(pid, addr, 1).unwrap();
    assert_eq!(k.free_frames(), 0);
    assert_eq!(k.user_write(pid, addr + 4096, 1), Err(KernelError::Killed(pid)));
    assert_eq!(k.free_frames(), 3);
}

#[test]
fn illegal_user_traps_kill_and_syscall_gate_is_open() {
    let mut k = kernel();
    let pid = k.spawn("int").unwrap();
    // `int 64` from user space reaches the syscall dispatcher.
    k.user_interrupt(pid, T_SYSCALL).unwrap();
    assert_eq!(k.user_interrupt(pid, T_ILLOP), Err(KernelError::Killed(pid)));

    let other = k.spawn("timer").unwrap();
    let before = lazymap::trap::ticks();
    k.timer_interrupt(other).unwrap();
    assert!(lazymap::trap::ticks() > before);
}

#[test]
fn no_access_region_kills_on_touch() {
    let mut k = kernel();
    let pid = k.spawn("none").unwrap();
    let ret = k.syscall(pid, SYS_MMAP, &[0, 4096, Prot::NONE.bits(), ANON, NO_FD, 0]).unwrap();
    let addr = decode_mmap_ret(ret).unwrap();
    let before = k.free_frames();
    assert_eq!(k.user_read(pid, addr), Err(KernelError::Killed(pid)));
    assert_eq!(k.free_frames(), before + 2);
}

#[test]
fn map_unmap_cycles_fit_a_small_table_budget() {
    let config = VmConfig::new().with_phys_frames(16).unwrap().with_max_page_tables(2).unwrap();
    let mut k = Kernel::new(config);
    let pid = k.spawn("cycle").unwrap();
    for slot in 0..4u32 {
        let hint = slot * 0x40_0000;
        let addr = mmap(&mut k, pid, hint, 4096).unwrap();
        assert_eq!(addr, BASE + hint);
        k.user_write(pid, addr, 1).unwrap();
        assert_eq!(munmap(&mut k, pid, addr, 4096), Ok(()));
        let space = k.process(pid).unwrap().address_space();
        assert!(space.regions().is_empty());
        assert_eq!(space.page_directory().table_count(), 1);
    }
}
