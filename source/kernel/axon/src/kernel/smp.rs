// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SMP bookkeeping (CPU identity range, online mask)
//! OWNERS: @kernel-team
//! PUBLIC API: MAX_CPUS, OnlineMask, cpus()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: bounded CPU set; atomic online-mask updates; a CPU comes online exactly once

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::CpuId;

/// CPU ceiling; bounds the online mask and per-CPU scheduler state.
pub const MAX_CPUS: usize = 8;

/// Logical CPUs `0..ncpu`.
pub fn cpus(ncpu: usize) -> impl Iterator<Item = CpuId> {
    (0..ncpu.min(MAX_CPUS)).map(|i| CpuId::from_raw(i as u16))
}

/// Bitmask of CPUs that have entered the scheduler.
pub struct OnlineMask(AtomicUsize);

impl OnlineMask {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Marks `cpu` online; returns false if it already was.
    pub fn mark_online(&self, cpu: CpuId) -> bool {
        let bit = 1usize << cpu.as_index();
        self.0.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        cpu.as_index() < MAX_CPUS && self.0.load(Ordering::Acquire) & (1 << cpu.as_index()) != 0
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn bits(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for OnlineMask {
    fn default() -> Self {
        Self::new()
    }
}
