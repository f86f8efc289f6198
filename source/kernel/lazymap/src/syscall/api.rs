// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-mm-team
//! PUBLIC API: install_handlers(table), Context, sys_mmap, sys_munmap
//! DEPENDS_ON: mm::AddressSpace, task::Process, lazymap_abi
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; a failed call leaves
//!             no region and no page table behind

use lazymap_abi::{MapFlags, Prot, SYS_MMAP, SYS_MUNMAP};

use super::{Args, Error, SysResult, SyscallTable};
use crate::mm::{FrameAllocator, MmapRequest};
use crate::task::Process;
use crate::types::VirtAddr;

/// State handed to every handler: the calling process and the frame allocator.
pub struct Context<'a> {
    pub proc: &'a mut Process,
    pub frames: &'a mut dyn FrameAllocator,
}

impl<'a> Context<'a> {
    pub fn new(proc: &'a mut Process, frames: &'a mut dyn FrameAllocator) -> Self {
        Self { proc, frames }
    }

    fn arg(&self, args: &Args, index: usize) -> SysResult<u32> {
        args.word(&*self.proc, &*self.frames, index)
    }
}

// Typed decoders for the Decode→Check→Execute discipline

#[derive(Copy, Clone)]
struct MmapArgsTyped {
    hint: VirtAddr,
    len: i32,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u32,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(ctx: &Context<'_>, args: &Args) -> SysResult<Self> {
        Ok(Self {
            hint: VirtAddr::new(ctx.arg(args, 0)?),
            len: ctx.arg(args, 1)? as i32,
            prot: ctx.arg(args, 2)?,
            flags: ctx.arg(args, 3)?,
            fd: ctx.arg(args, 4)? as i32,
            offset: ctx.arg(args, 5)?,
        })
    }

    #[inline]
    fn check(&self) -> SysResult<MmapRequest> {
        let prot = Prot::from_bits(self.prot).ok_or(Error::BadFlags(self.prot))?;
        let flags = MapFlags::from_bits(self.flags).ok_or(Error::BadFlags(self.flags))?;
        Ok(MmapRequest { hint: self.hint, len: self.len, prot, flags, fd: self.fd, offset: self.offset })
    }
}

#[derive(Copy, Clone)]
struct MunmapArgsTyped {
    addr: VirtAddr,
    len: i32,
}

impl MunmapArgsTyped {
    #[inline]
    fn decode(ctx: &Context<'_>, args: &Args) -> SysResult<Self> {
        Ok(Self { addr: VirtAddr::new(ctx.arg(args, 0)?), len: ctx.arg(args, 1)? as i32 })
    }
}

/// `mmap(hint, length, prot, flags, fd, offset)`: returns the mapped start address.
pub fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let typed = MmapArgsTyped::decode(ctx, args)?;
    let req = typed.check()?;
    let start = ctx.proc.address_space_mut().mmap(&req).map_err(|err| {
        log::warn!(target: "mm", "pid {}: mmap len={} failed: {}", ctx.proc.pid(), req.len, err);
        err
    })?;
    Ok(start.raw())
}

/// `munmap(addr, length)`: returns 0.
pub fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let typed = MunmapArgsTyped::decode(ctx, args)?;
    let Context { proc, frames } = ctx;
    proc.address_space_mut().munmap(typed.addr, typed.len, &mut **frames)?;
    Ok(0)
}

/// Registers the mapping syscalls in `table`.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYS_MMAP, sys_mmap);
    table.register(SYS_MUNMAP, sys_munmap);
}
