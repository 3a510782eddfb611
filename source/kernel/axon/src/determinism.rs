// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic knobs shared across the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: seed(), set_seed()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient; default value stable across boots
//!
//! The virtual cycle counter starts from this seed so the queued-IPC scan
//! offset is reproducible on the host.

use core::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_SEED: u64 = 0x6178_6f6e; // ASCII "axon"

static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);

/// Returns the deterministic seed for pseudo random sources.
#[inline]
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

/// Overrides the deterministic seed.
#[inline]
pub fn set_seed(value: u64) {
    SEED.store(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_roundtrip() {
        let old = seed();
        set_seed(42);
        assert_eq!(seed(), 42);
        set_seed(old);
    }
}
