// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The environment's view of the processor and kernel-exported windows.

use axon_abi::{EnvId, EnvInfo, FaultRecord, PageFlags};

use crate::fork::ForkError;

/// Handler invoked by the upcall trampoline with the pushed fault record.
pub type FaultHandler = fn(&mut dyn Machine, &FaultRecord) -> Result<(), ForkError>;

/// One environment executing on a CPU.
///
/// Memory accesses behave like loads and stores: a fault is delivered to the kernel, which may
/// run the registered upcall before the access is retried. An access the kernel cannot repair
/// ends the environment and never returns.
pub trait Machine {
    /// Traps into the kernel with `number` and five argument words; returns the return slot.
    fn syscall(&mut self, number: usize, args: [usize; 5]) -> isize;

    /// Loads `buf.len()` bytes from `va`.
    fn read(&mut self, va: usize, buf: &mut [u8]);

    /// Stores `data` at `va`.
    fn write(&mut self, va: usize, data: &[u8]);

    /// Permission bits of the page mapping `va`, from the read-only page-table window.
    fn page_entry(&self, va: usize) -> Option<PageFlags>;

    /// Whether the page-directory entry covering `va` is present.
    fn span_present(&self, va: usize) -> bool;

    /// Record for `id` from the read-only environment array.
    fn env_info(&self, id: EnvId) -> Option<EnvInfo>;

    /// Handler stored in this environment's data segment.
    fn fault_handler(&self) -> Option<FaultHandler>;

    /// Stores the handler in this environment's data segment.
    fn set_fault_handler(&mut self, handler: FaultHandler);

    /// Current stack pointer.
    fn stack_pointer(&self) -> usize;

    /// Restores the trap-time context saved in `record`, as the trampoline's return does.
    fn resume(&mut self, record: &FaultRecord);
}
