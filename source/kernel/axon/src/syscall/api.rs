// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, ipc::{polling, queued}, mm::AddressSpaceManager, hal::{Console, CycleCounter}
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; ids and user addresses are checked
//!             before any kernel state changes; handlers never switch environments themselves
//!             (they request a reschedule and the trap router performs it)

use axon_abi::{EnvId, EnvStatus, PageFlags};

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CGETC, SYSCALL_CPUTS, SYSCALL_ENV_DESTROY,
    SYSCALL_ENV_SET_PGFAULT_UPCALL, SYSCALL_ENV_SET_STATUS, SYSCALL_EXOFORK, SYSCALL_GETENVID,
    SYSCALL_IPC_RECV, SYSCALL_IPC_RECV_QUEUED, SYSCALL_IPC_SEND_QUEUED, SYSCALL_IPC_TRY_SEND,
    SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP, SYSCALL_PAGE_UNMAP, SYSCALL_PAGING_SCAN, SYSCALL_YIELD,
};
use crate::env::{EnvTable, Reclaim};
use crate::hal::{Console, CycleCounter};
use crate::ipc::{self, queued};
use crate::mm::{AddressSpaceManager, AsHandle};
use crate::types::{CpuId, VirtAddr};

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub cpu: CpuId,
    pub caller: EnvId,
    pub envs: &'a mut EnvTable,
    pub spaces: &'a mut AddressSpaceManager,
    pub console: &'a dyn Console,
    pub cycles: &'a dyn CycleCounter,
    /// Set by handlers that blocked, destroyed or yielded the caller.
    pub reschedule: bool,
}

impl<'a> Context<'a> {
    pub fn new(
        cpu: CpuId,
        caller: EnvId,
        envs: &'a mut EnvTable,
        spaces: &'a mut AddressSpaceManager,
        console: &'a dyn Console,
        cycles: &'a dyn CycleCounter,
    ) -> Self {
        Self { cpu, caller, envs, spaces, console, cycles, reschedule: false }
    }

    /// Resolves `id` with the parent-or-self check.
    fn checked(&self, id: EnvId) -> SysResult<EnvId> {
        Ok(self.envs.resolve(id, Some(self.caller), true)?)
    }

    fn space_of(&self, id: EnvId) -> SysResult<AsHandle> {
        self.envs
            .get(id)?
            .address_space()
            .ok_or(Error::Env(crate::env::EnvError::BadEnvironment))
    }

    /// Destroys `target` and requests a reschedule when the caller is gone.
    fn destroy(&mut self, target: EnvId) -> SysResult<()> {
        if target == self.caller {
            log_info!(target: "env", "[{}] exiting gracefully", self.caller);
        } else {
            log_info!(target: "env", "[{}] destroying {}", self.caller, target);
        }
        match self.envs.destroy(target, self.cpu, self.spaces)? {
            Reclaim::Freed if target == self.caller => self.reschedule = true,
            Reclaim::Freed | Reclaim::Deferred => {}
        }
        Ok(())
    }
}

// Typed decoders for Decode→Check→Execute

/// Decodes an environment id register; words that no id can encode fail `BadEnvironment`.
#[inline]
fn env_arg(word: usize) -> Result<EnvId, Error> {
    EnvId::try_from_word(word).ok_or(Error::Env(crate::env::EnvError::BadEnvironment))
}

/// A user page address plus permission bits destined for a mapping syscall.
#[derive(Copy, Clone)]
struct PagePerm {
    va: VirtAddr,
    perm: PageFlags,
}

impl PagePerm {
    #[inline]
    fn decode(va: usize, perm: usize) -> Result<Self, Error> {
        let va = VirtAddr::user_page(va).ok_or(Error::InvalidArgument)?;
        let perm = PageFlags::from_bits(perm).ok_or(Error::InvalidArgument)?;
        Ok(Self { va, perm })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if !self.perm.contains(PageFlags::PRESENT | PageFlags::USER) {
            return Err(Error::InvalidArgument);
        }
        if !PageFlags::SYSCALL.contains(self.perm) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    env: EnvId,
    page: PagePerm,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { env: env_arg(args.get(0))?, page: PagePerm::decode(args.get(1), args.get(2))? })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.page.check()
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: EnvId,
    srcva: VirtAddr,
    dst: EnvId,
    dst_page: PagePerm,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: env_arg(args.get(0))?,
            srcva: VirtAddr::user_page(args.get(1)).ok_or(Error::InvalidArgument)?,
            dst: env_arg(args.get(2))?,
            dst_page: PagePerm::decode(args.get(3), args.get(4))?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.dst_page.check()
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    env: EnvId,
    status: EnvStatus,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            env: env_arg(args.get(0))?,
            status: EnvStatus::from_word(args.get(1)).ok_or(Error::InvalidArgument)?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        // Only the scheduler makes environments RUNNING.
        if self.status == EnvStatus::Running {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    target: EnvId,
    value: usize,
    srcva: usize,
    perm: PageFlags,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: env_arg(args.get(0))?,
            value: args.get(1),
            srcva: args.get(2),
            perm: PageFlags::from_bits(args.get(3)).ok_or(Error::InvalidArgument)?,
        })
    }
}

#[derive(Copy, Clone)]
struct CputsArgsTyped {
    buf: usize,
    len: usize,
}

impl CputsArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { buf: args.get(0), len: args.get(1) })
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_CPUTS, sys_cputs);
    table.register(SYSCALL_CGETC, sys_cgetc);
    table.register(SYSCALL_GETENVID, sys_getenvid);
    table.register(SYSCALL_ENV_DESTROY, sys_env_destroy);
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_EXOFORK, sys_exofork);
    table.register(SYSCALL_ENV_SET_STATUS, sys_env_set_status);
    table.register(SYSCALL_PAGE_ALLOC, sys_page_alloc);
    table.register(SYSCALL_PAGE_MAP, sys_page_map);
    table.register(SYSCALL_PAGE_UNMAP, sys_page_unmap);
    table.register(SYSCALL_ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(SYSCALL_PAGING_SCAN, sys_paging_scan);
    table.register(SYSCALL_IPC_TRY_SEND, sys_ipc_try_send);
    table.register(SYSCALL_IPC_RECV, sys_ipc_recv);
    table.register(SYSCALL_IPC_SEND_QUEUED, sys_ipc_send_queued);
    table.register(SYSCALL_IPC_RECV_QUEUED, sys_ipc_recv_queued);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = CputsArgsTyped::decode(args)?;
    let handle = ctx.space_of(ctx.caller)?;
    if let Err(fault) = ctx.spaces.check_user(handle, typed.buf, typed.len, false) {
        log_warn!(target: "syscall", "[{}] cputs: user fault va {:#x}", ctx.caller, fault.va);
        ctx.destroy(ctx.caller)?;
        return Ok(0);
    }
    let mut chunk = [0u8; 128];
    let mut done = 0;
    while done < typed.len {
        let n = (typed.len - done).min(chunk.len());
        if ctx.spaces.read_user(handle, typed.buf + done, &mut chunk[..n]).is_err() {
            break;
        }
        ctx.console.write_bytes(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.console.read_byte().map_or(0, usize::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.as_word())
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.checked(env_arg(args.get(0))?)?;
    ctx.destroy(target)?;
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    crate::diag::liveness::bump();
    ctx.reschedule = true;
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let mut frame = *ctx.envs.get(ctx.caller)?.frame();
    frame.set_ret(0);
    let child = ctx.envs.allocate(ctx.caller, ctx.spaces)?;
    let env = ctx.envs.get_mut(child)?;
    env.frame = frame;
    env.status = EnvStatus::NotRunnable;
    log_debug!(target: "env", "[{}] exofork -> {}", ctx.caller, child);
    Ok(child.as_word())
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args)?;
    typed.check()?;
    let target = ctx.checked(typed.env)?;
    match typed.status {
        EnvStatus::Free | EnvStatus::Dying => {
            ctx.destroy(target)?;
        }
        status => {
            let env = ctx.envs.get(target)?;
            if env.status() == EnvStatus::Running && env.cpu() != Some(ctx.cpu) {
                return Err(Error::InvalidArgument);
            }
            ctx.envs.set_status(target, status, ctx.spaces)?;
            if target == ctx.caller {
                ctx.reschedule = true;
            }
        }
    }
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args)?;
    typed.check()?;
    let target = ctx.checked(typed.env)?;
    let handle = ctx.space_of(target)?;
    ctx.spaces.alloc_page(handle, typed.page.va.raw(), typed.page.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args)?;
    typed.check()?;
    let src = ctx.checked(typed.src)?;
    let dst = ctx.checked(typed.dst)?;
    let src_space = ctx.space_of(src)?;
    let dst_space = ctx.space_of(dst)?;
    let mapping = ctx
        .spaces
        .lookup(src_space, typed.srcva.raw())?
        .filter(|m| m.flags.contains(PageFlags::PRESENT | PageFlags::USER))
        .ok_or(Error::InvalidArgument)?;
    if typed.dst_page.perm.contains(PageFlags::WRITABLE) && !mapping.flags.contains(PageFlags::WRITABLE) {
        return Err(Error::InvalidArgument);
    }
    ctx.spaces.insert(dst_space, mapping.frame, typed.dst_page.va.raw(), typed.dst_page.perm)?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.checked(env_arg(args.get(0))?)?;
    let va = VirtAddr::user_page(args.get(1)).ok_or(Error::InvalidArgument)?;
    let handle = ctx.space_of(target)?;
    ctx.spaces.remove(handle, va.raw())?;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.checked(env_arg(args.get(0))?)?;
    ctx.envs.get_mut(target)?.pgfault_upcall = args.get(1);
    Ok(0)
}

fn sys_paging_scan(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let handle = ctx.space_of(ctx.caller)?;
    let mut count = 0;
    for (va, mapping) in ctx.spaces.mappings(handle)? {
        log_info!(target: "paging", "[{}] {:#010x} -> {} {:?}", ctx.caller, va, mapping.frame, mapping.flags);
        count += 1;
    }
    log_info!(target: "paging", "[{}] {} present mappings", ctx.caller, count);
    Ok(count)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    ipc::polling::try_send(ctx.envs, ctx.spaces, ctx.caller, typed.target, typed.value, typed.srcva, typed.perm)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ipc::polling::recv(ctx.envs, ctx.caller, args.get(0))?;
    ctx.reschedule = true;
    Ok(0)
}

fn sys_ipc_send_queued(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    let outcome =
        queued::send(ctx.envs, ctx.spaces, ctx.caller, typed.target, typed.value, typed.srcva, typed.perm)?;
    if outcome == queued::SendOutcome::Parked {
        ctx.reschedule = true;
    }
    Ok(0)
}

fn sys_ipc_recv_queued(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let capacity = ctx.envs.capacity().max(1);
    let start = (ctx.cycles.cycles() % capacity as u64) as usize;
    match queued::recv(ctx.envs, ctx.spaces, ctx.caller, args.get(0), start)? {
        queued::RecvOutcome::Received(from) => {
            log_trace!(target: "ipc", "[{}] fetched {}", ctx.caller, from);
        }
        queued::RecvOutcome::Blocked => ctx.reschedule = true,
    }
    Ok(0)
}
