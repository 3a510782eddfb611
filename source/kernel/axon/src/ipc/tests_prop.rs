// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for IPC page-transfer validation
//! OWNERS: @kernel-ipc-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Unaligned sources are rejected by both designs without touching either party
//!   - Permission bits outside the syscall mask are always rejected
//!   - Delivered perm equals the requested perm whenever a page moves
//!
//! TEST_SCENARIOS:
//!   - unaligned_source_never_mutates(): both designs return InvalidArgument, receiver unchanged
//!   - foreign_perm_bits_rejected(): any bit outside PageFlags::SYSCALL fails validation
//!   - delivered_perm_matches_request(): RO subsets of the mask arrive exactly as requested

use super::test_support::World;
use super::{polling, queued, validate_source, IpcError};
use axon_abi::{EnvStatus, PageFlags};
use proptest::prelude::*;

const PAGE: usize = 0x0050_0000;

fn base() -> PageFlags {
    PageFlags::PRESENT | PageFlags::USER
}

proptest! {
    #[test]
    fn unaligned_source_never_mutates(offset in 1usize..0x1000, queued_design in any::<bool>()) {
        let mut w = World::new(4);
        let a = w.spawn();
        let b = w.spawn();
        w.map(a, PAGE, base() | PageFlags::WRITABLE);
        polling::recv(&mut w.envs, b, PAGE).unwrap();
        let before = w.envs.get(b).unwrap().info();
        let result = if queued_design {
            queued::send(&mut w.envs, &mut w.spaces, a, b, 3, PAGE + offset, base()).map(|_| ())
        } else {
            polling::try_send(&mut w.envs, &mut w.spaces, a, b, 3, PAGE + offset, base())
        };
        prop_assert_eq!(result, Err(IpcError::InvalidArgument));
        prop_assert_eq!(w.envs.get(b).unwrap().info(), before);
        prop_assert_eq!(w.envs.get(a).unwrap().status(), EnvStatus::Runnable);
        prop_assert!(w.mapping(b, PAGE).is_none());
    }

    #[test]
    fn foreign_perm_bits_rejected(bits in any::<usize>()) {
        let perm = PageFlags::from_bits_retain(bits) | base();
        prop_assume!(!PageFlags::SYSCALL.contains(perm));
        let mut w = World::new(2);
        let a = w.spawn();
        w.map(a, PAGE, base() | PageFlags::WRITABLE);
        prop_assert_eq!(validate_source(&w.envs, &w.spaces, a, PAGE, perm), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn delivered_perm_matches_request(avail in 0usize..8) {
        let perm = base() | PageFlags::from_bits_retain(avail << 9);
        let mut w = World::new(4);
        let a = w.spawn();
        let b = w.spawn();
        w.map(a, PAGE, base());
        polling::recv(&mut w.envs, b, PAGE).unwrap();
        polling::try_send(&mut w.envs, &mut w.spaces, a, b, 3, PAGE, perm).unwrap();
        prop_assert_eq!(w.envs.get(b).unwrap().ipc().perm, perm);
        prop_assert_eq!(w.mapping(b, PAGE).map(|m| m.flags), Some(perm));
    }
}
