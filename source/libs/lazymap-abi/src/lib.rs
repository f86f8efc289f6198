// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions for the on-demand mapping syscalls
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SYS_MMAP, SYS_MUNMAP, Prot, MapFlags, Errno, decode_mmap_ret, decode_status
//! DEPENDS_ON: bitflags
//! INVARIANTS: Syscall numbers are stable; successful mmap returns are positive (< 2 GiB);
//!             failures are negative errno values

use bitflags::bitflags;

/// Syscall number of `mmap(hint, length, prot, flags, fd, offset)`.
pub const SYS_MMAP: u32 = 22;
/// Syscall number of `munmap(addr, length)`.
pub const SYS_MUNMAP: u32 = 23;

/// Number of argument words consumed by `mmap`.
pub const MMAP_ARGS: usize = 6;
/// Number of argument words consumed by `munmap`.
pub const MUNMAP_ARGS: usize = 2;

/// File descriptor value meaning "no backing file".
pub const NO_FD: i32 = -1;

bitflags! {
    /// Access protection requested for a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        /// Pages may be read.
        const READ = 0x1;
        /// Pages may be written.
        const WRITE = 0x2;
        /// Pages may be executed.
        const EXEC = 0x4;
    }
}

impl Prot {
    /// No access.
    pub const NONE: Self = Self::empty();
    /// Read/write shorthand used by most callers.
    pub const RW: Self = Self::READ.union(Self::WRITE);
}

bitflags! {
    /// Mapping kind flags.
    ///
    /// Only private anonymous mappings are backed; the other bits are recorded but
    /// reserved.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Changes are visible to other mappings of the same object (reserved).
        const SHARED = 0x01;
        /// Changes are private to the mapping process.
        const PRIVATE = 0x02;
        /// Mapping is not backed by a file.
        const ANONYMOUS = 0x20;
    }
}

impl MapFlags {
    /// Returns `true` when the flags describe a file-backed mapping.
    pub fn is_file_backed(self) -> bool {
        !self.contains(Self::ANONYMOUS)
    }
}

/// Error numbers returned (negated) by the mapping syscalls.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    /// No such process (ESRCH).
    NoSuchProcess = 3,
    /// Out of memory or address space (ENOMEM).
    OutOfMemory = 12,
    /// Bad address (EFAULT).
    BadAddress = 14,
    /// Invalid argument (EINVAL).
    InvalidArgument = 22,
    /// Function not implemented (ENOSYS).
    NotImplemented = 38,
}

impl Errno {
    /// Returns the positive errno value.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns the negative value placed in the syscall return register.
    pub const fn as_neg(self) -> i32 {
        -(self as i32)
    }

    /// Decodes a negative syscall return into an errno.
    pub const fn from_neg(ret: i32) -> Option<Self> {
        match ret {
            -3 => Some(Self::NoSuchProcess),
            -12 => Some(Self::OutOfMemory),
            -14 => Some(Self::BadAddress),
            -22 => Some(Self::InvalidArgument),
            -38 => Some(Self::NotImplemented),
            _ => None,
        }
    }
}

/// Splits an `mmap` return value into the mapped address or the failure errno.
///
/// Unknown negative values decode as [`Errno::InvalidArgument`].
pub fn decode_mmap_ret(ret: i32) -> Result<u32, Errno> {
    if ret < 0 {
        Err(Errno::from_neg(ret).unwrap_or(Errno::InvalidArgument))
    } else {
        Ok(ret as u32)
    }
}

/// Splits a status-style return (`0` on success) into `Ok(())` or the errno.
pub fn decode_status(ret: i32) -> Result<(), Errno> {
    match ret {
        0 => Ok(()),
        r if r < 0 => Err(Errno::from_neg(r).unwrap_or(Errno::InvalidArgument)),
        _ => Err(Errno::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_negation_is_reversible() {
        for errno in [
            Errno::NoSuchProcess,
            Errno::OutOfMemory,
            Errno::BadAddress,
            Errno::InvalidArgument,
            Errno::NotImplemented,
        ] {
            assert_eq!(Errno::from_neg(errno.as_neg()), Some(errno));
        }
        assert_eq!(Errno::InvalidArgument.code(), 22);
    }

    #[test]
    fn mmap_return_decoding() {
        assert_eq!(decode_mmap_ret(0x4000_0000), Ok(0x4000_0000));
        assert_eq!(decode_mmap_ret(-12), Err(Errno::OutOfMemory));
        assert_eq!(decode_mmap_ret(-1), Err(Errno::InvalidArgument));
    }

    #[test]
    fn status_decoding_rejects_positive_values() {
        assert_eq!(decode_status(0), Ok(()));
        assert_eq!(decode_status(-22), Err(Errno::InvalidArgument));
        assert_eq!(decode_status(7), Err(Errno::InvalidArgument));
    }

    #[test]
    fn anonymous_flag_controls_backing_kind() {
        assert!(!(MapFlags::ANONYMOUS | MapFlags::PRIVATE).is_file_backed());
        assert!(MapFlags::PRIVATE.is_file_backed());
        assert_eq!(Prot::RW, Prot::READ | Prot::WRITE);
    }
}
