// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Polling IPC: senders retry until the target is blocked in receive.
//!
//! Everything here runs under the kernel lock. Racing senders are not ordered; whoever takes
//! the lock first while the target is still receiving wins.

use axon_abi::{EnvId, EnvStatus, PageFlags};

use super::{block_in_receive, transfer, validate_destination, validate_source, IpcError};
use crate::env::EnvTable;
use crate::mm::AddressSpaceManager;

/// Delivers to `target` if it is blocked in receive, otherwise fails with `NotReceiving`.
pub fn try_send(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    caller: EnvId,
    target: EnvId,
    value: usize,
    srcva: usize,
    perm: PageFlags,
) -> Result<(), IpcError> {
    let target = envs.resolve(target, Some(caller), false)?;
    validate_source(envs, spaces, caller, srcva, perm)?;
    if !envs.get(target)?.ipc().recving {
        return Err(IpcError::NotReceiving);
    }
    transfer(envs, spaces, caller, target, value, srcva, perm)?;
    let env = envs.get_mut(target)?;
    env.status = EnvStatus::Runnable;
    Ok(())
}

/// Blocks `caller` until a sender delivers.
pub fn recv(envs: &mut EnvTable, caller: EnvId, dstva: usize) -> Result<(), IpcError> {
    validate_destination(dstva)?;
    block_in_receive(envs, caller, dstva)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::World;
    use super::*;
    use axon_abi::layout::UTOP;

    const PAGE: usize = 0x0050_0000;

    #[test]
    fn send_to_non_receiver_changes_nothing() {
        let mut w = World::new(4);
        let a = w.spawn();
        let b = w.spawn();
        let before = w.envs.get(b).unwrap().info();
        assert_eq!(
            try_send(&mut w.envs, &mut w.spaces, a, b, 42, UTOP, PageFlags::empty()),
            Err(IpcError::NotReceiving)
        );
        assert_eq!(w.envs.get(b).unwrap().info(), before);
    }

    #[test]
    fn value_reaches_blocked_receiver() {
        let mut w = World::new(4);
        let a = w.spawn();
        let b = w.spawn();
        recv(&mut w.envs, b, UTOP).unwrap();
        assert_eq!(w.envs.get(b).unwrap().status(), EnvStatus::NotRunnable);
        try_send(&mut w.envs, &mut w.spaces, a, b, 42, UTOP, PageFlags::empty()).unwrap();
        let env = w.envs.get(b).unwrap();
        assert_eq!(env.status(), EnvStatus::Runnable);
        assert_eq!(env.ipc().value, 42);
        assert_eq!(env.ipc().from, a);
        assert_eq!(env.ipc().perm, PageFlags::empty());
        assert_eq!(env.frame().ret(), 0);
    }

    #[test]
    fn unknown_target_is_bad_environment() {
        let mut w = World::new(4);
        let a = w.spawn();
        let gone = w.spawn();
        w.envs.free(gone, &mut w.spaces).unwrap();
        assert_eq!(
            try_send(&mut w.envs, &mut w.spaces, a, gone, 1, UTOP, PageFlags::empty()),
            Err(IpcError::BadEnvironment)
        );
    }

    #[test]
    fn bad_source_fails_before_receiver_is_touched() {
        let mut w = World::new(4);
        let a = w.spawn();
        let b = w.spawn();
        w.map(a, PAGE, PageFlags::PRESENT | PageFlags::USER);
        recv(&mut w.envs, b, PAGE).unwrap();
        let flags = PageFlags::PRESENT | PageFlags::USER;
        assert_eq!(
            try_send(&mut w.envs, &mut w.spaces, a, b, 1, PAGE + 4, flags),
            Err(IpcError::InvalidArgument)
        );
        assert_eq!(
            try_send(&mut w.envs, &mut w.spaces, a, b, 1, PAGE, flags | PageFlags::WRITABLE),
            Err(IpcError::InvalidArgument)
        );
        let env = w.envs.get(b).unwrap();
        assert!(env.ipc().recving);
        assert_eq!(env.status(), EnvStatus::NotRunnable);
    }

    #[test]
    fn unaligned_receive_is_rejected() {
        let mut w = World::new(2);
        let b = w.spawn();
        assert_eq!(recv(&mut w.envs, b, PAGE + 1), Err(IpcError::InvalidArgument));
        assert!(!w.envs.get(b).unwrap().ipc().recving);
    }
}
