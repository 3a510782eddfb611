// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the environment table
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Ids stay unique across arbitrary allocate/free sequences
//!   - Stale ids never resolve after their slot is reused
//!   - Frames are fully returned once every environment is freed
//!
//! TEST_SCENARIOS:
//!   - ids_are_never_reused_while_live(): random alloc/free keeps live ids distinct and resolvable
//!   - stale_ids_never_resolve(): every freed id fails lookup forever after
//!   - freeing_everything_returns_all_frames(): no frame leaks across churn

use alloc::vec::Vec;

use super::{EnvId, EnvTable};
use crate::mm::AddressSpaceManager;
use proptest::prelude::*;

const CAPACITY: usize = 8;

fn arb_ops() -> impl Strategy<Value = Vec<Option<usize>>> {
    // None = allocate, Some(i) = free the i-th live env (mod live count)
    proptest::collection::vec(proptest::option::of(0usize..CAPACITY), 1..64)
}

proptest! {
    #[test]
    fn ids_are_never_reused_while_live(ops in arb_ops()) {
        let mut envs = EnvTable::new(CAPACITY);
        let mut spaces = AddressSpaceManager::new(CAPACITY * 2);
        let mut live: Vec<EnvId> = Vec::new();
        for op in ops {
            match op {
                None => {
                    if let Ok(id) = envs.allocate(EnvId::SELF, &mut spaces) {
                        prop_assert!(!live.contains(&id));
                        live.push(id);
                    } else {
                        prop_assert_eq!(live.len(), CAPACITY);
                    }
                }
                Some(i) if !live.is_empty() => {
                    let id = live.swap_remove(i % live.len());
                    envs.free(id, &mut spaces).unwrap();
                }
                Some(_) => {}
            }
            prop_assert_eq!(envs.live(), live.len());
            for id in &live {
                prop_assert!(envs.get(*id).is_ok());
            }
        }
    }

    #[test]
    fn stale_ids_never_resolve(ops in arb_ops()) {
        let mut envs = EnvTable::new(CAPACITY);
        let mut spaces = AddressSpaceManager::new(CAPACITY * 2);
        let mut live: Vec<EnvId> = Vec::new();
        let mut dead: Vec<EnvId> = Vec::new();
        for op in ops {
            match op {
                None => {
                    if let Ok(id) = envs.allocate(EnvId::SELF, &mut spaces) {
                        live.push(id);
                    }
                }
                Some(i) if !live.is_empty() => {
                    let id = live.swap_remove(i % live.len());
                    envs.free(id, &mut spaces).unwrap();
                    dead.push(id);
                }
                Some(_) => {}
            }
            for id in &dead {
                prop_assert!(envs.lookup(*id, None, false).is_err());
            }
        }
    }

    #[test]
    fn freeing_everything_returns_all_frames(ops in arb_ops()) {
        let mut envs = EnvTable::new(CAPACITY);
        let mut spaces = AddressSpaceManager::new(CAPACITY * 2);
        let total = spaces.free_frames();
        let mut live: Vec<EnvId> = Vec::new();
        for op in ops {
            match op {
                None => {
                    if let Ok(id) = envs.allocate(EnvId::SELF, &mut spaces) {
                        live.push(id);
                    }
                }
                Some(i) if !live.is_empty() => {
                    let id = live.swap_remove(i % live.len());
                    envs.free(id, &mut spaces).unwrap();
                }
                Some(_) => {}
            }
        }
        for id in live.drain(..) {
            envs.free(id, &mut spaces).unwrap();
        }
        prop_assert_eq!(spaces.free_frames(), total);
        prop_assert_eq!(envs.live(), 0);
    }
}
