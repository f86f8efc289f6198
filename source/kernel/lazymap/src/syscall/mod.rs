// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher, argument fetch and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult
//! DEPENDS_ON: mm, task, syscall::api, lazymap_abi
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             an argument word is only read from inside the caller's image

pub mod api;

use lazymap_abi::Errno;

use crate::mm::{FrameAllocator, MmapError, PAGE_SIZE};
use crate::task::Process;
use crate::types::VirtAddr;

/// Maximum number of syscalls supported by this increment.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    #[error("unknown syscall {0}")]
    InvalidSyscall(u32),
    /// Argument word `i` could not be read from the caller's stack.
    #[error("argument {0} cannot be fetched")]
    BadArgument(usize),
    /// Protection or flag bits outside the defined set.
    #[error("unknown flag bits {0:#x}")]
    BadFlags(u32),
    /// The mapping layer rejected the request.
    #[error(transparent)]
    Mmap(#[from] MmapError),
}

impl Error {
    /// Errno reported to user space.
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidSyscall(_) => Errno::NotImplemented,
            Self::BadArgument(_) | Self::BadFlags(_) => Errno::InvalidArgument,
            Self::Mmap(MmapError::Placement(_) | MmapError::Mapping(_)) => Errno::OutOfMemory,
            Self::Mmap(
                MmapError::InvalidLength(_) | MmapError::NotMapped(_) | MmapError::UnsupportedFlags(_),
            ) => Errno::InvalidArgument,
        }
    }

    /// Value placed in the return register.
    pub fn to_ret(&self) -> u32 {
        self.errno().as_neg() as u32
    }
}

/// Argument words of one system call, read lazily from the user stack.
///
/// Word `i` lives at `esp + 4 + 4 * i`; `esp` itself holds the return address.
#[derive(Clone, Copy, Debug)]
pub struct Args {
    esp: u32,
}

impl Args {
    pub const fn new(esp: u32) -> Self {
        Self { esp }
    }

    /// Fetches argument word `index` of `proc`.
    ///
    /// Fails when the word is not wholly inside the process image or its page is not
    /// present.
    pub fn word(&self, proc: &Process, frames: &dyn FrameAllocator, index: usize) -> SysResult<u32> {
        let addr = (index as u32)
            .checked_mul(4)
            .and_then(|off| off.checked_add(4))
            .and_then(|off| self.esp.checked_add(off))
            .ok_or(Error::BadArgument(index))?;
        fetch_word(proc, frames, addr).ok_or(Error::BadArgument(index))
    }

    /// Signed view of [`Self::word`].
    pub fn int(&self, proc: &Process, frames: &dyn FrameAllocator, index: usize) -> SysResult<i32> {
        self.word(proc, frames, index).map(|w| w as i32)
    }
}

/// Reads a little-endian word from the image of `proc`.
fn fetch_word(proc: &Process, frames: &dyn FrameAllocator, addr: u32) -> Option<u32> {
    let end = addr.checked_add(4)?;
    if end > proc.image_size() {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let va = VirtAddr::new(addr + i as u32);
        let (pa, _) = proc.address_space().translate(va)?;
        let frame = frames.frame(crate::types::PhysAddr::new(pa.raw() & !(PAGE_SIZE as u32 - 1)))?;
        *byte = frame[va.page_offset()];
    }
    Some(u32::from_le_bytes(bytes))
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<u32>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: u32, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: u32, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<u32> {
        self.handlers
            .get(number as usize)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall(number))
            .and_then(|handler| handler(ctx, args))
    }
}
