// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User fault delivery through the registered upcall.
//!
//! The record is written at the very top of the exception stack and the environment resumes at
//! its upcall with `sp` pointing at the record. A fault taken while already on the exception
//! stack is not delivered again.

use axon_abi::layout::{PAGE_SIZE, UXSTACKTOP};
use axon_abi::{EnvId, FaultRecord};

use crate::env::EnvTable;
use crate::mm::{AccessFault, AddressSpaceManager};

/// Why an upcall could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpcallError {
    /// The environment no longer exists.
    NoEnvironment,
    /// No upcall entry point is registered.
    NoHandler,
    /// The faulting code was already running on the exception stack.
    Recursive,
    /// Writing the record faulted (exception stack missing or read-only).
    StackFault(AccessFault),
}

/// Whether `sp` lies inside the exception stack page.
#[inline]
pub fn on_exception_stack(sp: usize) -> bool {
    (UXSTACKTOP - PAGE_SIZE..UXSTACKTOP).contains(&sp)
}

/// Pushes a fault record for `id` and redirects its saved frame to the upcall.
pub fn deliver_upcall(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    id: EnvId,
    fault_va: usize,
) -> Result<FaultRecord, UpcallError> {
    let env = envs.get(id).map_err(|_| UpcallError::NoEnvironment)?;
    let upcall = env.pgfault_upcall();
    if upcall == 0 {
        return Err(UpcallError::NoHandler);
    }
    if on_exception_stack(env.frame().sp) {
        return Err(UpcallError::Recursive);
    }
    let handle = env.address_space().ok_or(UpcallError::NoEnvironment)?;
    let record = env.frame().fault_record(fault_va);
    let top = UXSTACKTOP - FaultRecord::SIZE;
    spaces.write_user(handle, top, &record.encode()).map_err(UpcallError::StackFault)?;

    let env = envs.get_mut(id).map_err(|_| UpcallError::NoEnvironment)?;
    env.frame.sp = top;
    env.frame.ip = upcall;
    Ok(record)
}
