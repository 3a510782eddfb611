// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous value + page IPC between environments
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per design + proptest for transfer validation (tests_prop.rs)
//! PUBLIC API: IpcError, PageOffer, validate_source(), transfer(), polling::*, queued::*
//! DEPENDS_ON: env::EnvTable, mm::AddressSpaceManager
//! INVARIANTS: Sender-side checks run before any state changes; a page moves only when both ends
//!             are below UTOP; a failed mapping leaves the receiver untouched; delivered perm is
//!             exactly the requested perm (empty when no page moved)

pub mod polling;
pub mod queued;

#[cfg(test)]
mod tests_prop;

use core::fmt;

use axon_abi::layout::{is_page_aligned, UTOP};
use axon_abi::{EnvId, ErrorCode, PageFlags};

use crate::env::{EnvError, EnvTable};
use crate::mm::{AddressSpaceError, AddressSpaceManager, Mapping};

/// IPC failures, one per user-visible error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    BadEnvironment,
    InvalidArgument,
    OutOfMemory,
    NotReceiving,
}

impl IpcError {
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::BadEnvironment => ErrorCode::BadEnvironment,
            Self::InvalidArgument => ErrorCode::InvalidArgument,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::NotReceiving => ErrorCode::IpcNotReceiving,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<EnvError> for IpcError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::OutOfMemory => Self::OutOfMemory,
            EnvError::InvalidStatus => Self::InvalidArgument,
            EnvError::BadEnvironment | EnvError::NoFreeSlot => Self::BadEnvironment,
        }
    }
}

impl From<AddressSpaceError> for IpcError {
    fn from(err: AddressSpaceError) -> Self {
        match err {
            AddressSpaceError::OutOfMemory => Self::OutOfMemory,
            AddressSpaceError::InvalidHandle => Self::BadEnvironment,
            AddressSpaceError::Mapping(_) => Self::InvalidArgument,
        }
    }
}

/// A checked page offer: the sender's mapping at `srcva` may be shared with `perm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOffer {
    pub srcva: usize,
    pub perm: PageFlags,
    pub mapping: Mapping,
}

/// Sender-side checks. `Ok(None)` means the message carries no page.
pub fn validate_source(
    envs: &EnvTable,
    spaces: &AddressSpaceManager,
    sender: EnvId,
    srcva: usize,
    perm: PageFlags,
) -> Result<Option<PageOffer>, IpcError> {
    if srcva >= UTOP {
        return Ok(None);
    }
    if !is_page_aligned(srcva) || !PageFlags::SYSCALL.contains(perm) {
        return Err(IpcError::InvalidArgument);
    }
    let handle = envs.get(sender)?.address_space().ok_or(IpcError::BadEnvironment)?;
    let mapping = spaces
        .lookup(handle, srcva)?
        .filter(|m| m.flags.contains(PageFlags::PRESENT | PageFlags::USER))
        .ok_or(IpcError::InvalidArgument)?;
    if perm.contains(PageFlags::WRITABLE) && !mapping.flags.contains(PageFlags::WRITABLE) {
        return Err(IpcError::InvalidArgument);
    }
    Ok(Some(PageOffer { srcva, perm, mapping }))
}

/// Receiver-side alignment check for `dstva`.
pub fn validate_destination(dstva: usize) -> Result<(), IpcError> {
    if dstva < UTOP && !is_page_aligned(dstva) {
        return Err(IpcError::InvalidArgument);
    }
    Ok(())
}

/// Delivers `value` (and the page, if both ends ask for one) from `from` into `to`.
///
/// On success `to` has `recving == false` and its from/value/perm fields set; its status is
/// left to the caller. On failure `to` is unchanged.
pub fn transfer(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    from: EnvId,
    to: EnvId,
    value: usize,
    srcva: usize,
    perm: PageFlags,
) -> Result<(), IpcError> {
    let offer = validate_source(envs, spaces, from, srcva, perm)?;
    let receiver = envs.get(to)?;
    let dstva = receiver.ipc().dstva;
    let mut delivered = PageFlags::empty();
    if let Some(offer) = offer {
        if dstva < UTOP {
            let handle = receiver.address_space().ok_or(IpcError::BadEnvironment)?;
            spaces.insert(
                handle,
                offer.mapping.frame,
                dstva,
                offer.perm | PageFlags::PRESENT | PageFlags::USER,
            )?;
            delivered = offer.perm;
        }
    }
    let receiver = envs.get_mut(to)?;
    receiver.ipc.recving = false;
    receiver.ipc.from = from;
    receiver.ipc.value = value;
    receiver.ipc.perm = delivered;
    log_debug!(target: "ipc", "{} -> {} value={:#x} perm={:?}", from, to, value, delivered);
    Ok(())
}

/// Puts `caller` to sleep in receive. Its saved return slot reads 0 on resumption.
pub(crate) fn block_in_receive(envs: &mut EnvTable, caller: EnvId, dstva: usize) -> Result<(), IpcError> {
    let env = envs.get_mut(caller)?;
    env.ipc.recving = true;
    env.ipc.dstva = dstva;
    env.status = axon_abi::EnvStatus::NotRunnable;
    env.cpu = None;
    env.frame.set_ret(0);
    Ok(())
}
