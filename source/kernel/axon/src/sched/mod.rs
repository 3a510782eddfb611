// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU round-robin scheduler
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/current/pick/dispatch/schedule/forget), Decision
//! DEPENDS_ON: env::EnvTable, hal::Monitor, diag::liveness
//! INVARIANTS: Scan starts just after the CPU's last environment; idle environments are never picked
//!             by the scan; at most one RUNNING environment per CPU; a RUNNING environment is never
//!             picked by another CPU (only RUNNABLE ones are candidates)

use alloc::vec;
use alloc::vec::Vec;

use axon_abi::{EnvId, EnvStatus, EnvType};

use crate::diag::liveness;
use crate::env::EnvTable;
use crate::hal::Monitor;
use crate::types::CpuId;

#[cfg(test)]
mod tests_prop;

/// Outcome of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The environment was dispatched on this CPU.
    Run(EnvId),
    /// No useful work anywhere; the CPU sits in the monitor.
    Monitor,
}

/// Per-CPU scheduling state; the environment state itself lives in the table.
pub struct Scheduler {
    current: Vec<Option<EnvId>>,
}

static_assertions::assert_not_impl_any!(Scheduler: Clone);

impl Scheduler {
    pub fn new(ncpu: usize) -> Self {
        Self { current: vec![None; ncpu] }
    }

    pub fn ncpu(&self) -> usize {
        self.current.len()
    }

    /// Environment this CPU last dispatched, if it still exists.
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.current.get(cpu.as_index()).copied().flatten()
    }

    /// Forgets the CPU's current environment (after it was freed).
    pub fn forget(&mut self, cpu: CpuId) {
        if let Some(slot) = self.current.get_mut(cpu.as_index()) {
            *slot = None;
        }
    }

    /// Next RUNNABLE non-idle environment in round-robin order, without side effects.
    pub fn pick(&self, cpu: CpuId, envs: &EnvTable) -> Option<EnvId> {
        let capacity = envs.capacity();
        if capacity == 0 {
            return None;
        }
        let start = self.current(cpu).map_or(0, |id| id.index() + 1);
        (0..capacity)
            .map(|k| (start + k) % capacity)
            .filter_map(|i| envs.slot(i))
            .find(|env| env.status() == EnvStatus::Runnable && env.env_type() != EnvType::Idle)
            .map(|env| env.id())
    }

    /// Makes `id` the RUNNING environment of `cpu`.
    ///
    /// The CPU's previous environment, if still RUNNING, is demoted to RUNNABLE.
    pub fn dispatch(&mut self, cpu: CpuId, id: EnvId, envs: &mut EnvTable) {
        if let Some(prev) = self.current(cpu) {
            if prev != id {
                if let Ok(env) = envs.get_mut(prev) {
                    if env.status == EnvStatus::Running {
                        env.status = EnvStatus::Runnable;
                        env.cpu = None;
                    }
                }
            }
        }
        if let Ok(env) = envs.get_mut(id) {
            env.status = EnvStatus::Running;
            env.runs = env.runs.wrapping_add(1);
            env.cpu = Some(cpu);
        }
        if let Some(slot) = self.current.get_mut(cpu.as_index()) {
            *slot = Some(id);
        }
        liveness::bump();
        log_trace!(target: "sched", "cpu{} -> {}", cpu, id);
    }

    /// Full scheduling pass for `cpu`.
    pub fn schedule(&mut self, cpu: CpuId, envs: &mut EnvTable, monitor: &dyn Monitor) -> Decision {
        if let Some(id) = self.pick(cpu, envs) {
            self.dispatch(cpu, id, envs);
            return Decision::Run(id);
        }

        let useful = envs.iter().any(|env| {
            env.env_type() != EnvType::Idle
                && matches!(env.status(), EnvStatus::Runnable | EnvStatus::Running)
        });
        if !useful {
            log_warn!(target: "sched", "cpu{}: no runnable environments", cpu);
            self.demote_current(cpu, envs);
            monitor.no_runnable(cpu);
            return Decision::Monitor;
        }

        let idle = envs
            .slot(cpu.as_index())
            .filter(|env| env.env_type() == EnvType::Idle)
            .filter(|env| matches!(env.status(), EnvStatus::Runnable | EnvStatus::Running));
        match idle {
            Some(env) => {
                let id = env.id();
                self.dispatch(cpu, id, envs);
                Decision::Run(id)
            }
            None => panic!("sched: cpu{} idle environment is not runnable", cpu),
        }
    }

    fn demote_current(&mut self, cpu: CpuId, envs: &mut EnvTable) {
        if let Some(prev) = self.current(cpu) {
            if let Ok(env) = envs.get_mut(prev) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                    env.cpu = None;
                }
            }
        }
    }
}
