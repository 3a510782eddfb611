// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-level page-fault handling.
//!
//! The kernel pushes a [`FaultRecord`] at the top of the exception stack and resumes the
//! environment at [`UPCALL_ENTRY`]. The trampoline there calls the stored handler and then
//! returns to the trap-time context, so the faulting access is retried.

use axon_abi::layout::{PAGE_SIZE, UTEXT, UXSTACKTOP};
use axon_abi::{EnvId, ErrorCode, FaultRecord, PageFlags};

use crate::machine::{FaultHandler, Machine};
use crate::syscall::{sys_env_destroy, sys_env_set_pgfault_upcall, sys_page_alloc};

/// Address of the upcall trampoline in the runtime's text.
pub const UPCALL_ENTRY: usize = UTEXT + 0x20;

/// Installs `handler`, allocating the exception stack and registering the upcall the first time.
pub fn set_pgfault_handler(m: &mut dyn Machine, handler: FaultHandler) -> Result<(), ErrorCode> {
    if m.fault_handler().is_none() {
        let perm = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
        sys_page_alloc(m, EnvId::SELF, UXSTACKTOP - PAGE_SIZE, perm)?;
        sys_env_set_pgfault_upcall(m, EnvId::SELF, UPCALL_ENTRY)?;
    }
    m.set_fault_handler(handler);
    Ok(())
}

/// Body of the trampoline at [`UPCALL_ENTRY`].
///
/// Reads the record at the stack pointer, runs the handler and restores the trap-time context.
/// A missing handler, a malformed record or a failing handler ends the environment.
pub fn upcall_entry(m: &mut dyn Machine) {
    let mut bytes = [0u8; FaultRecord::SIZE];
    let sp = m.stack_pointer();
    m.read(sp, &mut bytes);
    let Some(record) = FaultRecord::decode(&bytes) else {
        exit(m);
    };
    let Some(handler) = m.fault_handler() else {
        exit(m);
    };
    if handler(m, &record).is_err() {
        exit(m);
    }
    m.resume(&record);
}

/// Destroys the calling environment.
pub fn exit(m: &mut dyn Machine) -> ! {
    match sys_env_destroy(m, EnvId::SELF) {
        Ok(()) => panic!("environment survived its own destruction"),
        Err(code) => panic!("self-destroy refused: {:?}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::mock::MockMachine;
    use axon_abi::syscall as nr;

    #[test]
    #[should_panic(expected = "self-destroy refused: BadEnvironment")]
    fn refused_exit_names_the_error() {
        let mut m = MockMachine::new();
        m.reply(nr::ENV_DESTROY, ErrorCode::BadEnvironment.as_return());
        exit(&mut m);
    }

    #[test]
    fn handler_registration_maps_the_exception_stack_once() {
        fn noop(_: &mut dyn Machine, _: &FaultRecord) -> Result<(), crate::ForkError> {
            Ok(())
        }
        let mut m = MockMachine::new();
        set_pgfault_handler(&mut m, noop).unwrap();
        set_pgfault_handler(&mut m, noop).unwrap();
        let allocs = m.calls.iter().filter(|(n, _)| *n == nr::PAGE_ALLOC).count();
        assert_eq!(allocs, 1);
        assert_eq!(m.page_entry(UXSTACKTOP - PAGE_SIZE), Some(PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE));
    }
}
