// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-wide lock with lockdep-style re-entry detection
//! OWNERS: @kernel-sync-team
//! PUBLIC API: KernelLock::new(), KernelLock::lock(cpu), KernelGuard
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: A CPU never acquires the lock twice; holder is cleared before release

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::types::CpuId;

const NO_HOLDER: usize = usize::MAX;

/// Spin lock that remembers which CPU holds it.
pub struct KernelLock<T> {
    inner: spin::Mutex<T>,
    holder: AtomicUsize,
    acquisitions: AtomicU64,
}

impl<T> KernelLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            holder: AtomicUsize::new(NO_HOLDER),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Acquires the lock on behalf of `cpu`, spinning while another CPU holds it.
    pub fn lock(&self, cpu: CpuId) -> KernelGuard<'_, T> {
        if self.holder.load(Ordering::SeqCst) == cpu.as_index() {
            log_error!(target: "lockdep", "cpu {} re-entered the kernel lock", cpu);
            panic!("lockdep: double-lock on cpu {}", cpu);
        }
        let guard = self.inner.lock();
        self.holder.store(cpu.as_index(), Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        KernelGuard { parent: self, guard }
    }

    /// CPU currently holding the lock.
    pub fn holder(&self) -> Option<CpuId> {
        match self.holder.load(Ordering::SeqCst) {
            NO_HOLDER => None,
            raw => Some(CpuId::from_raw(raw as u16)),
        }
    }

    /// Total number of successful acquisitions.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

pub struct KernelGuard<'a, T> {
    parent: &'a KernelLock<T>,
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> Deref for KernelGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for KernelGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T> Drop for KernelGuard<'a, T> {
    fn drop(&mut self) {
        self.parent.holder.store(NO_HOLDER, Ordering::SeqCst);
        // inner guard releases after this
    }
}
