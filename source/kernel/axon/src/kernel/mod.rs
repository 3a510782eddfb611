// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel facade: aggregated state behind the kernel lock plus trap entry points
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + std-thread SMP tests (tests.rs), axon-user integration tests
//! PUBLIC API: Kernel (trap/start_cpu, loader and inspection helpers), boot(), BootError, smp
//! DEPENDS_ON: sync::KernelLock, env::EnvTable, mm::AddressSpaceManager, sched::Scheduler,
//!             syscall::SyscallTable, trap::route, hal::Platform
//! INVARIANTS: Every entry point takes the kernel lock exactly once; traps and inspection from
//!             the same CPU never overlap

mod boot;
pub mod smp;


use alloc::vec::Vec;
use core::fmt::{self, Write};

use axon_abi::{EnvInfo, EnvStatus, EnvType, FaultCode, PageFlags};

pub use boot::{boot, BootError};

use crate::config::KernelConfig;
use crate::env::{EnvError, EnvTable};
use crate::hal::Platform;
use crate::mm::{AccessFault, AddressSpaceError, AddressSpaceManager, AsHandle};
use crate::sched::Scheduler;
use crate::sync::KernelLock;
use crate::syscall::SyscallTable;
use crate::trap::{self, TrapExit, TrapFrame};
use crate::types::{CpuId, EnvId};

/// Aggregated kernel state guarded by the kernel lock.
pub(crate) struct KernelState {
    pub(crate) envs: EnvTable,
    pub(crate) spaces: AddressSpaceManager,
    pub(crate) sched: Scheduler,
}

impl KernelState {
    fn space_of(&self, id: EnvId) -> Result<AsHandle, EnvError> {
        self.envs.get(id)?.address_space().ok_or(EnvError::BadEnvironment)
    }
}

/// A booted kernel shared by every CPU.
pub struct Kernel {
    state: KernelLock<KernelState>,
    syscalls: SyscallTable,
    platform: Platform,
    config: KernelConfig,
    online: smp::OnlineMask,
}

impl Kernel {
    /// Handles one trap taken on `cpu`.
    ///
    /// On return `frame` holds the context of the environment named by the exit, or is
    /// untouched when the CPU parked in the monitor.
    pub fn trap(&self, cpu: CpuId, frame: &mut TrapFrame) -> TrapExit {
        let mut state = self.state.lock(cpu);
        trap::route(&mut state, &self.platform, &self.syscalls, cpu, frame)
    }

    /// First entry of `cpu` into the scheduler.
    pub fn start_cpu(&self, cpu: CpuId, frame: &mut TrapFrame) -> TrapExit {
        if cpu.as_index() >= self.config.ncpu {
            panic!("smp: cpu{} beyond configured ncpu {}", cpu, self.config.ncpu);
        }
        if !self.online.mark_online(cpu) {
            log_warn!(target: "smp", "cpu{} started twice", cpu);
        }
        log_info!(target: "smp", "cpu{} online ({} up)", cpu, self.online.count());
        let mut state = self.state.lock(cpu);
        trap::reschedule(&mut state, &self.platform, cpu, frame)
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn online(&self) -> &smp::OnlineMask {
        &self.online
    }

    /// Creates a RUNNABLE environment with no parent, as the loader does for initial programs.
    pub fn create_env(&self, cpu: CpuId, env_type: EnvType) -> Result<EnvId, EnvError> {
        let mut state = self.state.lock(cpu);
        let KernelState { envs, spaces, .. } = &mut *state;
        envs.allocate_as(EnvId::SELF, env_type, spaces)
    }

    /// Maps a fresh zeroed page into `env` without going through the syscall checks.
    pub fn map_page(&self, cpu: CpuId, env: EnvId, va: usize, flags: PageFlags) -> Result<(), AddressSpaceError> {
        let mut state = self.state.lock(cpu);
        let handle = state.space_of(env).map_err(|_| AddressSpaceError::InvalidHandle)?;
        state.spaces.alloc_page(handle, va, flags)
    }

    /// Points the saved context of `env` at `ip` with stack `sp`.
    pub fn set_entry(&self, cpu: CpuId, env: EnvId, ip: usize, sp: usize) -> Result<(), EnvError> {
        let mut state = self.state.lock(cpu);
        let env = state.envs.get_mut(env)?;
        env.frame.ip = ip;
        env.frame.sp = sp;
        Ok(())
    }

    pub fn set_status(&self, cpu: CpuId, env: EnvId, status: EnvStatus) -> Result<(), EnvError> {
        let mut state = self.state.lock(cpu);
        let KernelState { envs, spaces, .. } = &mut *state;
        envs.set_status(env, status, spaces)
    }

    /// Reads user memory of `env` as user mode on `cpu` would.
    pub fn user_read(&self, cpu: CpuId, env: EnvId, va: usize, buf: &mut [u8]) -> Result<(), AccessFault> {
        let state = self.state.lock(cpu);
        let handle = state.space_of(env).map_err(|_| AccessFault { va, code: FaultCode::USER })?;
        state.spaces.read_user(handle, va, buf)
    }

    /// Writes user memory of `env` as user mode on `cpu` would.
    pub fn user_write(&self, cpu: CpuId, env: EnvId, va: usize, data: &[u8]) -> Result<(), AccessFault> {
        let mut state = self.state.lock(cpu);
        let handle = state
            .space_of(env)
            .map_err(|_| AccessFault { va, code: FaultCode::USER | FaultCode::WRITE })?;
        state.spaces.write_user(handle, va, data)
    }

    /// Permission bits of the page mapping `va` in `env`; `None` when unmapped.
    pub fn page_entry(&self, cpu: CpuId, env: EnvId, va: usize) -> Option<PageFlags> {
        let state = self.state.lock(cpu);
        let handle = state.space_of(env).ok()?;
        state.spaces.lookup(handle, va).ok().flatten().map(|m| m.flags)
    }

    /// Whether a page-table page covers the directory span of `va` in `env`.
    pub fn span_present(&self, cpu: CpuId, env: EnvId, va: usize) -> bool {
        let state = self.state.lock(cpu);
        state
            .space_of(env)
            .ok()
            .and_then(|handle| state.spaces.span_present(handle, va).ok())
            .unwrap_or(false)
    }

    pub fn env_info(&self, cpu: CpuId, id: EnvId) -> Option<EnvInfo> {
        let state = self.state.lock(cpu);
        state.envs.get(id).ok().map(|env| env.info())
    }

    /// Snapshot of every live environment in slot order.
    pub fn envs(&self, cpu: CpuId) -> Vec<EnvInfo> {
        self.state.lock(cpu).envs.infos()
    }

    /// Saved context of `id`.
    pub fn frame_of(&self, cpu: CpuId, id: EnvId) -> Option<TrapFrame> {
        let state = self.state.lock(cpu);
        state.envs.get(id).ok().map(|env| *env.frame())
    }

    /// Queued senders currently parked on `id`.
    pub fn ipc_waiting(&self, cpu: CpuId, id: EnvId) -> Option<u32> {
        let state = self.state.lock(cpu);
        state.envs.get(id).ok().map(|env| env.queue().lock().waiting)
    }

    /// Environment last dispatched on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.state.lock(cpu).sched.current(cpu)
    }

    pub fn free_frames(&self, cpu: CpuId) -> usize {
        self.state.lock(cpu).spaces.free_frames()
    }

    /// Writes the monitor's environment listing.
    pub fn fmt_envs<W: Write>(&self, cpu: CpuId, w: &mut W) -> fmt::Result {
        let infos = self.envs(cpu);
        crate::diag::fmt_envs(&infos, w)
    }
}
