// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod virt;

use alloc::sync::Arc;

use crate::trap::TrapFrame;
use crate::types::{CpuId, EnvId};

/// Byte-oriented console.
pub trait Console: Send + Sync {
    /// Writes raw bytes to the console.
    fn write_bytes(&self, bytes: &[u8]);
    /// Returns the next pending input byte, if any. Never blocks.
    fn read_byte(&self) -> Option<u8>;
}

/// Free-running per-CPU cycle counter.
pub trait CycleCounter: Send + Sync {
    /// Returns the current cycle count.
    fn cycles(&self) -> u64;
}

/// What the debugger wants done with a stopped environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugAction {
    /// Resume normally (clears single-step).
    Continue,
    /// Resume for one instruction, then trap again.
    Step,
    /// Destroy the environment.
    Kill,
}

/// Interactive debugging console.
pub trait Monitor: Send + Sync {
    /// Entered on breakpoint and single-step traps.
    fn breakpoint(&self, cpu: CpuId, env: Option<EnvId>, frame: &TrapFrame) -> DebugAction;
    /// Entered when no environment anywhere has work to do.
    fn no_runnable(&self, cpu: CpuId);
}

/// Devices the kernel core talks to.
#[derive(Clone)]
pub struct Platform {
    pub console: Arc<dyn Console>,
    pub cycles: Arc<dyn CycleCounter>,
    pub monitor: Arc<dyn Monitor>,
}

impl Platform {
    /// In-memory devices suitable for host runs.
    pub fn virt() -> Self {
        Self {
            console: Arc::new(virt::BufferConsole::new()),
            cycles: Arc::new(virt::VirtCycles::new(crate::determinism::seed())),
            monitor: Arc::new(virt::RecordingMonitor::new(DebugAction::Continue)),
        }
    }
}
