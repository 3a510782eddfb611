// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Queued IPC: senders park on their own outbox until the receiver fetches them.
//!
//! Each environment's `IpcQueue` lock guards its waiting count and outbox. Those locks are only
//! taken while the kernel lock is held, and never two at once.

use axon_abi::{EnvId, EnvStatus, PageFlags};

use super::{block_in_receive, transfer, validate_destination, validate_source, IpcError};
use crate::env::{EnvTable, Outgoing};
use crate::mm::AddressSpaceManager;

/// Result of a queued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Target was receiving; delivered without blocking.
    Delivered,
    /// Caller is parked until the target fetches the message.
    Parked,
}

/// Result of a queued receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A parked sender was fetched; the caller keeps running.
    Received(EnvId),
    /// No sender was waiting; the caller is blocked.
    Blocked,
}

pub fn send(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    caller: EnvId,
    target: EnvId,
    value: usize,
    srcva: usize,
    perm: PageFlags,
) -> Result<SendOutcome, IpcError> {
    let target = envs.resolve(target, Some(caller), false)?;
    if target == caller {
        // Nobody could ever fetch it.
        return Err(IpcError::InvalidArgument);
    }
    validate_source(envs, spaces, caller, srcva, perm)?;

    let receiving = {
        let env = envs.get(target)?;
        let mut queue = env.queue().lock();
        if !env.ipc().recving {
            queue.waiting += 1;
        }
        env.ipc().recving
    };
    if receiving {
        transfer(envs, spaces, caller, target, value, srcva, perm)?;
        envs.get_mut(target)?.status = EnvStatus::Runnable;
        return Ok(SendOutcome::Delivered);
    }

    let env = envs.get_mut(caller)?;
    env.queue.get_mut().outbox = Some(Outgoing { to: target, value, srcva, perm });
    env.status = EnvStatus::NotRunnable;
    env.cpu = None;
    log_debug!(target: "ipc", "{} parked on {}", caller, target);
    Ok(SendOutcome::Parked)
}

/// Fetches a parked sender if there is one, scanning from `start`; otherwise blocks.
pub fn recv(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    caller: EnvId,
    dstva: usize,
    start: usize,
) -> Result<RecvOutcome, IpcError> {
    validate_destination(dstva)?;
    let waiting = envs.get(caller)?.queue().lock().waiting;
    if waiting > 0 {
        {
            let env = envs.get_mut(caller)?;
            env.ipc.recving = true;
            env.ipc.dstva = dstva;
        }
        let capacity = envs.capacity();
        for k in 0..capacity {
            let index = (start + k) % capacity;
            let Some((sender, out)) = take_parked(envs, index, caller) else {
                continue;
            };
            {
                let mut queue = envs.get(caller)?.queue().lock();
                queue.waiting = queue.waiting.saturating_sub(1);
            }
            let result = transfer(envs, spaces, sender, caller, out.value, out.srcva, out.perm);
            let env = envs.get_mut(sender)?;
            env.frame.set_ret(match result {
                Ok(()) => 0,
                Err(err) => err.code().as_return() as usize,
            });
            env.status = EnvStatus::Runnable;
            match result {
                Ok(()) => return Ok(RecvOutcome::Received(sender)),
                Err(err) => log_warn!(target: "ipc", "fetch from {} failed: {}", sender, err),
            }
        }
    }
    block_in_receive(envs, caller, dstva)?;
    Ok(RecvOutcome::Blocked)
}

/// Takes the outbox of slot `index` if it is parked on `target`.
fn take_parked(envs: &EnvTable, index: usize, target: EnvId) -> Option<(EnvId, Outgoing)> {
    let env = envs.slot(index).filter(|e| !e.is_free())?;
    let mut queue = env.queue().lock();
    match queue.outbox {
        Some(out) if out.to == target => {
            queue.outbox = None;
            Some((env.id(), out))
        }
        _ => None,
    }
}
