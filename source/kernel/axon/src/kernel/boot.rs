// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel bring-up: configuration, state construction, idle environments
//! OWNERS: @kernel-boot-team
//! PUBLIC API: boot(), BootError
//! DEPENDS_ON: config::KernelConfig, diag::log, env::EnvTable, mm::AddressSpaceManager
//! INVARIANTS: Single invocation per kernel instance; idle environment of CPU n lives in slot n

use core::fmt;

use axon_abi::{EnvId, EnvType};

use super::{smp, Kernel, KernelState};
use crate::config::{ConfigError, KernelConfig};
use crate::diag::log;
use crate::env::{EnvError, EnvTable};
use crate::hal::Platform;
use crate::mm::AddressSpaceManager;
use crate::sched::Scheduler;
use crate::sync::KernelLock;
use crate::syscall::SyscallTable;

/// Why the kernel failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Config(ConfigError),
    /// An idle environment could not be created.
    Idle { cpu: usize, err: EnvError },
}

impl From<ConfigError> for BootError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Builds a kernel for `config` on `platform`.
///
/// Creates one idle environment per CPU before anything else so CPU `n` finds its idle
/// environment in table slot `n`. No CPU is running afterwards; each enters through
/// [`Kernel::start_cpu`].
pub fn boot(config: KernelConfig, platform: Platform) -> Result<Kernel, BootError> {
    config.validate()?;
    log::set_max_level(config.log_level);
    log_info!(
        target: "boot",
        "boot: ncpu={} envs={} frames={}",
        config.ncpu,
        config.env_capacity,
        config.phys_frames
    );

    let mut envs = EnvTable::new(config.env_capacity);
    let mut spaces = AddressSpaceManager::new(config.phys_frames);
    for cpu in smp::cpus(config.ncpu) {
        let id = envs
            .allocate_as(EnvId::SELF, EnvType::Idle, &mut spaces)
            .map_err(|err| BootError::Idle { cpu: cpu.as_index(), err })?;
        log_debug!(target: "boot", "cpu{} idle {}", cpu, id);
    }

    let state = KernelState { envs, spaces, sched: Scheduler::new(config.ncpu) };
    log_info!(target: "boot", "boot: ok");
    Ok(Kernel {
        state: KernelLock::new(state),
        syscalls: SyscallTable::default(),
        platform,
        config,
        online: smp::OnlineMask::new(),
    })
}
