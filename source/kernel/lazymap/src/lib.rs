// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

//! CONTEXT: On-demand virtual-memory mapping core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Kernel, config::VmConfig, mm (mmap/munmap/fault), syscall, task, trap
//! DEPENDS_ON: lazymap-abi, bitflags, spin, log, thiserror, static_assertions
//! INVARIANTS: `mmap` only reserves; frames are allocated one page at a time by the
//!             fault path and reclaimed by `munmap` or process exit

extern crate alloc;

pub mod config;
pub mod kernel;
pub mod mm;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;

pub use config::{ConfigError, VmConfig};
pub use kernel::{Kernel, KernelError};
pub use types::{PageLen, PhysAddr, Pid, VirtAddr};
