// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed wrappers over the raw syscall instruction.
//!
//! Each wrapper packs its arguments in ABI order and decodes the signed return word; negative
//! words become [`ErrorCode`].

use axon_abi::syscall as nr;
use axon_abi::{EnvId, EnvStatus, ErrorCode, PageFlags};

use crate::machine::Machine;

/// Result of a kernel call.
pub type SysResult<T> = Result<T, ErrorCode>;

fn call(m: &mut dyn Machine, number: usize, args: [usize; 5]) -> SysResult<usize> {
    ErrorCode::check(m.syscall(number, args))
}

/// Writes `len` bytes at `va` to the console.
pub fn sys_cputs(m: &mut dyn Machine, va: usize, len: usize) -> SysResult<()> {
    call(m, nr::CPUTS, [va, len, 0, 0, 0]).map(drop)
}

/// Next console byte, if one is pending.
pub fn sys_cgetc(m: &mut dyn Machine) -> Option<u8> {
    match call(m, nr::CGETC, [0; 5]) {
        Ok(0) | Err(_) => None,
        Ok(byte) => Some(byte as u8),
    }
}

/// Id of the calling environment.
pub fn sys_getenvid(m: &mut dyn Machine) -> EnvId {
    EnvId::from_word(m.syscall(nr::GETENVID, [0; 5]) as usize)
}

/// Destroys `env` (`EnvId::SELF` for the caller).
pub fn sys_env_destroy(m: &mut dyn Machine, env: EnvId) -> SysResult<()> {
    call(m, nr::ENV_DESTROY, [env.as_word(), 0, 0, 0, 0]).map(drop)
}

/// Gives up the CPU.
pub fn sys_yield(m: &mut dyn Machine) {
    m.syscall(nr::YIELD, [0; 5]);
}

/// Clones the caller. The parent sees the child's id, the child sees `EnvId::SELF`.
pub fn sys_exofork(m: &mut dyn Machine) -> SysResult<EnvId> {
    call(m, nr::EXOFORK, [0; 5]).map(EnvId::from_word)
}

/// Sets the status of `env`.
pub fn sys_env_set_status(m: &mut dyn Machine, env: EnvId, status: EnvStatus) -> SysResult<()> {
    call(m, nr::ENV_SET_STATUS, [env.as_word(), status.as_word(), 0, 0, 0]).map(drop)
}

/// Maps a fresh zeroed page at `va` in `env`.
pub fn sys_page_alloc(m: &mut dyn Machine, env: EnvId, va: usize, perm: PageFlags) -> SysResult<()> {
    call(m, nr::PAGE_ALLOC, [env.as_word(), va, perm.bits(), 0, 0]).map(drop)
}

/// Maps the page at `srcva` in `src` into `dst` at `dstva`.
pub fn sys_page_map(
    m: &mut dyn Machine,
    src: EnvId,
    srcva: usize,
    dst: EnvId,
    dstva: usize,
    perm: PageFlags,
) -> SysResult<()> {
    call(m, nr::PAGE_MAP, [src.as_word(), srcva, dst.as_word(), dstva, perm.bits()]).map(drop)
}

/// Removes the mapping at `va` in `env`.
pub fn sys_page_unmap(m: &mut dyn Machine, env: EnvId, va: usize) -> SysResult<()> {
    call(m, nr::PAGE_UNMAP, [env.as_word(), va, 0, 0, 0]).map(drop)
}

/// Registers `entry` as the fault upcall of `env`.
pub fn sys_env_set_pgfault_upcall(m: &mut dyn Machine, env: EnvId, entry: usize) -> SysResult<()> {
    call(m, nr::ENV_SET_PGFAULT_UPCALL, [env.as_word(), entry, 0, 0, 0]).map(drop)
}

/// Logs the caller's present mappings; returns how many there are.
pub fn sys_paging_scan(m: &mut dyn Machine) -> SysResult<usize> {
    call(m, nr::PAGING_SCAN, [0; 5])
}

/// Polling send; fails with `IpcNotReceiving` unless `to` is blocked in receive.
pub fn sys_ipc_try_send(m: &mut dyn Machine, to: EnvId, value: usize, srcva: usize, perm: PageFlags) -> SysResult<()> {
    call(m, nr::IPC_TRY_SEND, [to.as_word(), value, srcva, perm.bits(), 0]).map(drop)
}

/// Blocks until a polling sender delivers.
pub fn sys_ipc_recv(m: &mut dyn Machine, dstva: usize) -> SysResult<()> {
    call(m, nr::IPC_RECV, [dstva, 0, 0, 0, 0]).map(drop)
}

/// Queued send; parks the caller until the target fetches the message.
pub fn sys_ipc_send_queued(m: &mut dyn Machine, to: EnvId, value: usize, srcva: usize, perm: PageFlags) -> SysResult<()> {
    call(m, nr::IPC_SEND_QUEUED, [to.as_word(), value, srcva, perm.bits(), 0]).map(drop)
}

/// Queued receive; fetches a parked message or blocks.
pub fn sys_ipc_recv_queued(m: &mut dyn Machine, dstva: usize) -> SysResult<()> {
    call(m, nr::IPC_RECV_QUEUED, [dstva, 0, 0, 0, 0]).map(drop)
}
