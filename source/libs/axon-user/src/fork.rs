// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write `fork` and the shared-memory `sfork` variant.
//!
//! The kernel only provides `exofork` and page-mapping primitives; copying happens lazily in
//! [`cow_fault`], which runs from the fault upcall.

use axon_abi::layout::{PAGE_SIZE, PFTEMP, PT_SPAN, USTACKTOP, UTOP, UXSTACKTOP};
use axon_abi::{EnvId, EnvStatus, ErrorCode, FaultCode, FaultRecord, PageFlags};
use thiserror::Error;

use crate::machine::Machine;
use crate::pgfault::{set_pgfault_handler, UPCALL_ENTRY};
use crate::syscall::{
    sys_env_set_pgfault_upcall, sys_env_set_status, sys_exofork, sys_page_alloc, sys_page_map,
    sys_page_unmap,
};

/// Errors produced while cloning or resolving a copy-on-write fault.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// The kernel refused to create the child.
    #[error("exofork failed: {0}")]
    Exofork(ErrorCode),
    /// A mapping or status call failed.
    #[error("syscall failed: {0}")]
    Syscall(ErrorCode),
    /// The fault is not a user write to a present copy-on-write page.
    #[error("fault at {va:#x} (err {err:#x}) is not a copy-on-write write")]
    NotCopyOnWrite {
        /// Faulting address.
        va: usize,
        /// Hardware error bits.
        err: usize,
    },
}

impl From<ErrorCode> for ForkError {
    fn from(value: ErrorCode) -> Self {
        Self::Syscall(value)
    }
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// The original environment; `child` is RUNNABLE.
    Parent {
        /// Id of the new environment.
        child: EnvId,
    },
    /// The new environment.
    Child,
}

const PUW: PageFlags = PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::WRITABLE);

/// Fault handler that gives the faulting environment a private copy of a COW page.
pub fn cow_fault(m: &mut dyn Machine, record: &FaultRecord) -> Result<(), ForkError> {
    let va = record.fault_va;
    let err = FaultCode::from_bits_retain(record.err);
    let need = FaultCode::PROTECTION | FaultCode::WRITE | FaultCode::USER;
    let cow = m.span_present(va) && m.page_entry(va).is_some_and(|pte| pte.contains(PageFlags::COW));
    if !err.contains(need) || !cow {
        return Err(ForkError::NotCopyOnWrite { va, err: record.err });
    }

    let base = va & !(PAGE_SIZE - 1);
    sys_page_alloc(m, EnvId::SELF, PFTEMP, PUW)?;
    let mut page = [0u8; PAGE_SIZE];
    m.read(base, &mut page);
    m.write(PFTEMP, &page);
    sys_page_map(m, EnvId::SELF, PFTEMP, EnvId::SELF, base, PUW)?;
    sys_page_unmap(m, EnvId::SELF, PFTEMP)?;
    Ok(())
}

/// Maps page `va` into `child`, turning writable pages copy-on-write in both environments.
///
/// The child is mapped first so the parent's page is never writable while shared.
fn duppage(m: &mut dyn Machine, child: EnvId, va: usize, pte: PageFlags) -> Result<(), ErrorCode> {
    let perm = pte & PageFlags::SYSCALL;
    if perm.intersects(PageFlags::WRITABLE | PageFlags::COW) {
        let cow = (perm - PageFlags::WRITABLE) | PageFlags::COW;
        sys_page_map(m, EnvId::SELF, va, child, va, cow)?;
        sys_page_map(m, EnvId::SELF, va, EnvId::SELF, va, cow)?;
    } else {
        sys_page_map(m, EnvId::SELF, va, child, va, perm)?;
    }
    Ok(())
}

/// Maps page `va` into `child` with the same permissions; writes stay visible to both.
fn sharepage(m: &mut dyn Machine, child: EnvId, va: usize, pte: PageFlags) -> Result<(), ErrorCode> {
    sys_page_map(m, EnvId::SELF, va, child, va, pte & PageFlags::SYSCALL)
}

/// Visits every present user page below `UTOP` except the exception stack.
fn for_each_user_page(
    m: &mut dyn Machine,
    mut visit: impl FnMut(&mut dyn Machine, usize, PageFlags) -> Result<(), ErrorCode>,
) -> Result<(), ErrorCode> {
    let mut span = 0;
    while span < UTOP {
        if m.span_present(span) {
            let end = (span + PT_SPAN).min(UTOP);
            for va in (span..end).step_by(PAGE_SIZE) {
                if va == UXSTACKTOP - PAGE_SIZE {
                    continue;
                }
                match m.page_entry(va) {
                    Some(pte) if pte.contains(PageFlags::PRESENT | PageFlags::USER) => visit(m, va, pte)?,
                    _ => {}
                }
            }
        }
        span += PT_SPAN;
    }
    Ok(())
}

fn clone_with(
    m: &mut dyn Machine,
    mut dup: impl FnMut(&mut dyn Machine, EnvId, usize, PageFlags) -> Result<(), ErrorCode>,
) -> Result<ForkResult, ForkError> {
    set_pgfault_handler(m, cow_fault)?;
    let child = sys_exofork(m).map_err(ForkError::Exofork)?;
    if child.is_self() {
        return Ok(ForkResult::Child);
    }

    sys_page_alloc(m, child, UXSTACKTOP - PAGE_SIZE, PUW)?;
    sys_env_set_pgfault_upcall(m, child, UPCALL_ENTRY)?;
    for_each_user_page(m, |m, va, pte| dup(m, child, va, pte))?;
    sys_env_set_status(m, child, EnvStatus::Runnable)?;
    Ok(ForkResult::Parent { child })
}

/// Clones the caller with copy-on-write sharing of every writable page.
pub fn fork(m: &mut dyn Machine) -> Result<ForkResult, ForkError> {
    clone_with(m, duppage)
}

/// Clones the caller sharing all memory except the top stack page, which is copy-on-write.
pub fn sfork(m: &mut dyn Machine) -> Result<ForkResult, ForkError> {
    clone_with(m, |m, child, va, pte| {
        if va == USTACKTOP - PAGE_SIZE {
            duppage(m, child, va, pte)
        } else {
            sharepage(m, child, va, pte)
        }
    })
}
