// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON kernel core: environments, scheduling, IPC, syscalls and trap routing
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptests (tests_prop.rs), axon-user integration tests
//! PUBLIC API: boot(), Kernel, KernelConfig, Platform, TrapFrame, TrapExit
//! INVARIANTS: All kernel state lives behind one KernelLock; dispatch is cooperative, every
//!             trap entry returns the frame of the environment to resume

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod determinism;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod types;

pub use config::{ConfigError, KernelConfig};
pub use hal::Platform;
pub use kernel::{boot, BootError, Kernel};
pub use trap::{Mode, TrapExit, TrapFrame};
pub use types::{CpuId, EnvId};
