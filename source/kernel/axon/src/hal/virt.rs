// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory HAL devices for host execution.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::{Console, CycleCounter, DebugAction, Monitor};
use crate::trap::TrapFrame;
use crate::types::{CpuId, EnvId};

/// Console backed by byte buffers.
pub struct BufferConsole {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl BufferConsole {
    pub const fn new() -> Self {
        Self { output: Mutex::new(Vec::new()), input: Mutex::new(VecDeque::new()) }
    }

    /// Queues bytes to be returned by `read_byte`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Takes everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }
}

impl Default for BufferConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for BufferConsole {
    fn write_bytes(&self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    fn read_byte(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }
}

/// Counter that advances by a fixed odd stride on every read.
pub struct VirtCycles {
    now: AtomicU64,
}

impl VirtCycles {
    const STRIDE: u64 = 0x9e37_79b9;

    pub const fn new(seed: u64) -> Self {
        Self { now: AtomicU64::new(seed) }
    }
}

impl CycleCounter for VirtCycles {
    fn cycles(&self) -> u64 {
        self.now.fetch_add(Self::STRIDE, Ordering::Relaxed)
    }
}

/// A monitor stop observed by [`RecordingMonitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stop {
    pub cpu: CpuId,
    pub env: Option<EnvId>,
    pub ip: usize,
}

/// Monitor that records entries and answers with a preset action.
pub struct RecordingMonitor {
    action: Mutex<DebugAction>,
    stops: Mutex<Vec<Stop>>,
    idle_entries: AtomicUsize,
}

impl RecordingMonitor {
    pub const fn new(action: DebugAction) -> Self {
        Self { action: Mutex::new(action), stops: Mutex::new(Vec::new()), idle_entries: AtomicUsize::new(0) }
    }

    pub fn set_action(&self, action: DebugAction) {
        *self.action.lock() = action;
    }

    pub fn stops(&self) -> Vec<Stop> {
        self.stops.lock().clone()
    }

    pub fn idle_entries(&self) -> usize {
        self.idle_entries.load(Ordering::SeqCst)
    }
}

impl Monitor for RecordingMonitor {
    fn breakpoint(&self, cpu: CpuId, env: Option<EnvId>, frame: &TrapFrame) -> DebugAction {
        self.stops.lock().push(Stop { cpu, env, ip: frame.ip });
        *self.action.lock()
    }

    fn no_runnable(&self, cpu: CpuId) {
        self.idle_entries.fetch_add(1, Ordering::SeqCst);
        log_warn!(target: "monitor", "cpu {}: no runnable environments", cpu);
    }
}
