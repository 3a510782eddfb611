// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for round-robin selection
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Every runnable environment is visited once per cycle from any starting point
//!   - Blocked environments are never dispatched
//!
//! TEST_SCENARIOS:
//!   - cycle_visits_each_runnable_once(): N dispatches cover N distinct runnable environments
//!   - blocked_envs_are_skipped(): NOT_RUNNABLE environments never appear in the dispatch order

use alloc::vec::Vec;

use super::{Decision, Scheduler};
use crate::env::EnvTable;
use crate::hal::virt::RecordingMonitor;
use crate::hal::DebugAction;
use crate::mm::AddressSpaceManager;
use crate::types::CpuId;
use axon_abi::{EnvId, EnvStatus, EnvType};
use proptest::prelude::*;

const CAPACITY: usize = 16;

proptest! {
    #[test]
    fn cycle_visits_each_runnable_once(count in 2usize..CAPACITY, warmup in 0usize..CAPACITY) {
        let mut envs = EnvTable::new(CAPACITY);
        let mut spaces = AddressSpaceManager::new(CAPACITY * 2);
        let monitor = RecordingMonitor::new(DebugAction::Continue);
        envs.allocate_as(EnvId::SELF, EnvType::Idle, &mut spaces).unwrap();
        for _ in 0..count {
            envs.allocate(EnvId::SELF, &mut spaces).unwrap();
        }
        let mut sched = Scheduler::new(1);
        for _ in 0..warmup {
            let _ = sched.schedule(CpuId::BOOT, &mut envs, &monitor);
        }
        let mut seen: Vec<EnvId> = Vec::new();
        for _ in 0..count {
            match sched.schedule(CpuId::BOOT, &mut envs, &monitor) {
                Decision::Run(id) => {
                    prop_assert!(!seen.contains(&id));
                    seen.push(id);
                }
                Decision::Monitor => prop_assert!(false, "monitor with runnable work"),
            }
        }
        prop_assert_eq!(seen.len(), count);
    }

    #[test]
    fn blocked_envs_are_skipped(mask in proptest::collection::vec(any::<bool>(), 2..CAPACITY)) {
        let mut envs = EnvTable::new(CAPACITY);
        let mut spaces = AddressSpaceManager::new(CAPACITY * 2);
        let monitor = RecordingMonitor::new(DebugAction::Continue);
        envs.allocate_as(EnvId::SELF, EnvType::Idle, &mut spaces).unwrap();
        let mut blocked = Vec::new();
        for block in &mask {
            let id = envs.allocate(EnvId::SELF, &mut spaces).unwrap();
            if *block {
                envs.set_status(id, EnvStatus::NotRunnable, &mut spaces).unwrap();
                blocked.push(id);
            }
        }
        let mut sched = Scheduler::new(1);
        for _ in 0..mask.len() * 2 {
            if let Decision::Run(id) = sched.schedule(CpuId::BOOT, &mut envs, &monitor) {
                prop_assert!(!blocked.contains(&id));
            }
        }
    }
}
