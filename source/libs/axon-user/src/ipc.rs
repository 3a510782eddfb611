// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPC convenience wrappers for both kernel designs.
//!
//! Receives return the value, sender and permission read back from the caller's own environment record.
//! `perm` is empty when no page was transferred. Passing `None` for a page address means no
//! page is offered or accepted.

use axon_abi::layout::UTOP;
use axon_abi::{EnvId, ErrorCode, PageFlags};

use crate::machine::Machine;
use crate::syscall::{
    sys_getenvid, sys_ipc_recv, sys_ipc_recv_queued, sys_ipc_send_queued, sys_ipc_try_send, sys_yield,
};

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Value word.
    pub value: usize,
    /// Sender id.
    pub from: EnvId,
    /// Permission of the transferred page; empty when none was mapped.
    pub perm: PageFlags,
}

fn delivered(m: &mut dyn Machine) -> Result<Message, ErrorCode> {
    let me = sys_getenvid(m);
    let info = m.env_info(me).ok_or(ErrorCode::BadEnvironment)?;
    Ok(Message { value: info.ipc_value, from: info.ipc_from, perm: info.ipc_perm })
}

/// Sends through the polling design, yielding while the target is not yet receiving.
pub fn ipc_send(m: &mut dyn Machine, to: EnvId, value: usize, page: Option<usize>, perm: PageFlags) -> Result<(), ErrorCode> {
    let srcva = page.unwrap_or(UTOP);
    loop {
        match sys_ipc_try_send(m, to, value, srcva, perm) {
            Err(ErrorCode::IpcNotReceiving) => sys_yield(m),
            other => return other,
        }
    }
}

/// Blocks until a polling sender delivers, mapping any page at `page`.
pub fn ipc_recv(m: &mut dyn Machine, page: Option<usize>) -> Result<Message, ErrorCode> {
    sys_ipc_recv(m, page.unwrap_or(UTOP))?;
    delivered(m)
}

/// Sends through the queued design; returns once the target has fetched the message.
pub fn ipc_send_queued(
    m: &mut dyn Machine,
    to: EnvId,
    value: usize,
    page: Option<usize>,
    perm: PageFlags,
) -> Result<(), ErrorCode> {
    sys_ipc_send_queued(m, to, value, page.unwrap_or(UTOP), perm)
}

/// Fetches one parked message, blocking until a queued sender arrives if none is waiting.
pub fn ipc_recv_queued(m: &mut dyn Machine, page: Option<usize>) -> Result<Message, ErrorCode> {
    sys_ipc_recv_queued(m, page.unwrap_or(UTOP))?;
    delivered(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::mock::MockMachine;
    use axon_abi::syscall as nr;

    #[test]
    fn send_reports_hard_errors_without_retrying() {
        let mut m = MockMachine::new();
        m.reply(nr::IPC_TRY_SEND, ErrorCode::BadEnvironment.as_return());
        assert_eq!(ipc_send(&mut m, EnvId::from_parts(2, 1), 7, None, PageFlags::empty()), Err(ErrorCode::BadEnvironment));
        assert_eq!(m.calls.len(), 1);
        assert_eq!(m.calls[0].1[2], UTOP);
    }

    #[test]
    fn receive_errors_skip_the_readback() {
        let mut m = MockMachine::new();
        m.reply(nr::IPC_RECV, ErrorCode::InvalidArgument.as_return());
        assert_eq!(ipc_recv(&mut m, Some(0x1234)), Err(ErrorCode::InvalidArgument));
        assert_eq!(m.calls.len(), 1);
    }
}
