// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult, encode_result(), SYSCALL_* IDs
//! DEPENDS_ON: env, ipc, mm, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             unknown numbers fail InvalidArgument

pub mod api;

use core::fmt;

use axon_abi::ErrorCode;

use crate::{env, ipc, mm};

pub use axon_abi::syscall::{
    CGETC as SYSCALL_CGETC, CPUTS as SYSCALL_CPUTS, ENV_DESTROY as SYSCALL_ENV_DESTROY,
    ENV_SET_PGFAULT_UPCALL as SYSCALL_ENV_SET_PGFAULT_UPCALL,
    ENV_SET_STATUS as SYSCALL_ENV_SET_STATUS, EXOFORK as SYSCALL_EXOFORK,
    GETENVID as SYSCALL_GETENVID, IPC_RECV as SYSCALL_IPC_RECV,
    IPC_RECV_QUEUED as SYSCALL_IPC_RECV_QUEUED, IPC_SEND_QUEUED as SYSCALL_IPC_SEND_QUEUED,
    IPC_TRY_SEND as SYSCALL_IPC_TRY_SEND, PAGE_ALLOC as SYSCALL_PAGE_ALLOC,
    PAGE_MAP as SYSCALL_PAGE_MAP, PAGE_UNMAP as SYSCALL_PAGE_UNMAP,
    PAGING_SCAN as SYSCALL_PAGING_SCAN, YIELD as SYSCALL_YIELD,
};

/// Maximum number of syscalls supported by the table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in the five argument registers.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 5],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 5]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Malformed address, permission or status word.
    InvalidArgument,
    /// Environment table operation failed.
    Env(env::EnvError),
    /// Address-space manager reported an error.
    AddressSpace(mm::AddressSpaceError),
    /// IPC operation failed.
    Ipc(ipc::IpcError),
}

impl Error {
    /// User-visible error code.
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::InvalidSyscall | Self::InvalidArgument => ErrorCode::InvalidArgument,
            Self::Env(env::EnvError::BadEnvironment) => ErrorCode::BadEnvironment,
            Self::Env(env::EnvError::NoFreeSlot) => ErrorCode::NoFreeSlot,
            Self::Env(env::EnvError::OutOfMemory) => ErrorCode::OutOfMemory,
            Self::Env(env::EnvError::InvalidStatus) => ErrorCode::InvalidArgument,
            Self::AddressSpace(mm::AddressSpaceError::OutOfMemory) => ErrorCode::OutOfMemory,
            Self::AddressSpace(mm::AddressSpaceError::InvalidHandle) => ErrorCode::BadEnvironment,
            Self::AddressSpace(mm::AddressSpaceError::Mapping(_)) => ErrorCode::InvalidArgument,
            Self::Ipc(err) => err.code(),
        }
    }
}

impl From<env::EnvError> for Error {
    fn from(value: env::EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<mm::AddressSpaceError> for Error {
    fn from(value: mm::AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<mm::MapError> for Error {
    fn from(value: mm::MapError) -> Self {
        Self::AddressSpace(value.into())
    }
}

impl From<ipc::IpcError> for Error {
    fn from(value: ipc::IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encodes a handler result as the word placed in the return register.
pub fn encode_result(result: SysResult<usize>) -> usize {
    match result {
        Ok(value) => value,
        Err(err) => err.code().as_return() as usize,
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(Error::InvalidSyscall.code(), ErrorCode::InvalidArgument);
        assert_eq!(Error::from(env::EnvError::NoFreeSlot).code(), ErrorCode::NoFreeSlot);
        assert_eq!(Error::from(mm::AddressSpaceError::OutOfMemory).code(), ErrorCode::OutOfMemory);
        assert_eq!(Error::from(mm::MapError::Unaligned).code(), ErrorCode::InvalidArgument);
        assert_eq!(Error::from(ipc::IpcError::NotReceiving).code(), ErrorCode::IpcNotReceiving);
    }

    #[test]
    fn results_encode_as_signed_words() {
        assert_eq!(encode_result(Ok(7)), 7);
        assert_eq!(encode_result(Err(Error::Env(env::EnvError::BadEnvironment))) as isize, -1);
        assert_eq!(encode_result(Err(Error::InvalidSyscall)) as isize, -2);
    }
}
