// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! User-side runtime for AXON environments: typed syscalls, the fault upcall trampoline,
//! copy-on-write `fork`/`sfork` and IPC helpers.
//!
//! Everything runs against a [`Machine`], the view one environment has of its CPU: the
//! syscall instruction, its own memory, and the read-only page-table and environment windows
//! the kernel exports.

pub mod fork;
pub mod ipc;
pub mod machine;
pub mod pgfault;
pub mod syscall;

pub use fork::{fork, sfork, ForkError, ForkResult};
pub use machine::{FaultHandler, Machine};
