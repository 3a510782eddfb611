// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap router: snapshot, classify, dispatch, pick the next environment
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, Mode, Eflags, TrapExit, fmt_trap(), describe_trap(), record(), last_trap(),
//!             fault::{deliver_upcall, UpcallError}
//! DEPENDS_ON: env, sched, syscall, hal::Monitor, kernel::KernelState
//! INVARIANTS: A user trap snapshots the live frame into the current environment first; kernel-mode
//!             traps are fatal; control only returns into a RUNNING environment

pub mod fault;
mod frame;

use alloc::string::String;

use axon_abi::trap::{T_BRKPT, T_DEBUG, T_PGFLT, T_SYSCALL, T_TIMER};
use axon_abi::{EnvId, EnvStatus};
use spin::Mutex;

pub use frame::{describe_trap, fmt_trap, Eflags, Mode, TrapFrame};

use crate::diag::liveness;
use crate::hal::{DebugAction, Platform};
use crate::kernel::KernelState;
use crate::sched::Decision;
use crate::syscall::{api, encode_result, SyscallTable};
use crate::types::CpuId;

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);
const TRAP_RING_LEN: usize = 64;
static TRAP_RING: Mutex<[Option<TrapFrame>; TRAP_RING_LEN]> = Mutex::new([None; TRAP_RING_LEN]);
static TRAP_RING_IDX: Mutex<usize> = Mutex::new(0);

/// Where the CPU goes after a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapExit {
    /// The live frame now holds this environment's saved context.
    Resume(EnvId),
    /// No environment has work; the CPU is parked in the monitor.
    Monitor,
}

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
    let mut idx = TRAP_RING_IDX.lock();
    let mut ring = TRAP_RING.lock();
    ring[*idx % TRAP_RING_LEN] = Some(*frame);
    *idx = (*idx + 1) % TRAP_RING_LEN;
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

fn fatal(what: &str, frame: &TrapFrame) -> ! {
    let mut dump = String::new();
    let _ = fmt_trap(frame, &mut dump);
    panic!("{}\n{}", what, dump);
}

/// Handles one trap on `cpu` with the kernel lock held.
pub(crate) fn route(
    state: &mut KernelState,
    platform: &Platform,
    syscalls: &SyscallTable,
    cpu: CpuId,
    frame: &mut TrapFrame,
) -> TrapExit {
    liveness::bump();
    record(frame);
    #[cfg(feature = "trace_traps")]
    log_debug!(target: "trap", "cpu{} trap {:#x} ({}) ip={:#x}", cpu, frame.trapno, describe_trap(frame.trapno), frame.ip);

    if frame.mode == Mode::Kernel {
        if frame.trapno == T_PGFLT {
            fatal("kernel page fault", frame);
        }
        fatal("unhandled trap in kernel", frame);
    }

    let curenv = state.sched.current(cpu).filter(|id| {
        state.envs.get(*id).is_ok_and(|env| {
            matches!(env.status(), EnvStatus::Running | EnvStatus::Dying) && env.cpu() == Some(cpu)
        })
    });
    let Some(caller) = curenv else {
        // A parked CPU only comes back through its timer.
        if frame.trapno == T_TIMER {
            return reschedule(state, platform, cpu, frame);
        }
        fatal("user trap with no current environment", frame);
    };

    if state.envs.get(caller).map(|e| e.status()) == Ok(EnvStatus::Dying) {
        log_info!(target: "trap", "cpu{}: reclaiming dying {}", cpu, caller);
        if state.envs.free(caller, &mut state.spaces).is_err() {
            log_error!(target: "trap", "{} vanished during reclaim", caller);
        }
        state.sched.forget(cpu);
        return reschedule(state, platform, cpu, frame);
    }

    if let Ok(env) = state.envs.get_mut(caller) {
        env.frame = *frame;
    }

    let resched = match frame.trapno {
        T_PGFLT => user_fault(state, cpu, caller, frame.tval),
        T_BRKPT | T_DEBUG => debug_stop(state, platform, cpu, caller),
        T_SYSCALL => syscall(state, platform, syscalls, cpu, caller),
        T_TIMER => true,
        _ => {
            log_warn!(target: "trap", "[{}] unexpected trap {:#x} ({})", caller, frame.trapno, describe_trap(frame.trapno));
            user_fault(state, cpu, caller, frame.tval)
        }
    };

    if state.envs.get(caller).is_err() {
        state.sched.forget(cpu);
    }
    if resched {
        return reschedule(state, platform, cpu, frame);
    }
    match state.envs.get(caller) {
        Ok(env) if env.status() == EnvStatus::Running && env.cpu() == Some(cpu) => {
            *frame = *env.frame();
            TrapExit::Resume(caller)
        }
        Ok(env) => fatal(
            match env.status() {
                EnvStatus::Dying => "resuming a dying environment",
                _ => "resuming an environment that is not running",
            },
            env.frame(),
        ),
        Err(_) => reschedule(state, platform, cpu, frame),
    }
}

/// Runs the scheduler and loads the chosen environment into `frame`.
pub(crate) fn reschedule(state: &mut KernelState, platform: &Platform, cpu: CpuId, frame: &mut TrapFrame) -> TrapExit {
    match state.sched.schedule(cpu, &mut state.envs, &*platform.monitor) {
        Decision::Run(next) => match state.envs.get(next) {
            Ok(env) => {
                *frame = *env.frame();
                TrapExit::Resume(next)
            }
            Err(_) => panic!("sched: dispatched {} is gone", next),
        },
        Decision::Monitor => TrapExit::Monitor,
    }
}

/// Destroys the current environment after an undeliverable fault.
fn kill(state: &mut KernelState, cpu: CpuId, id: EnvId) -> bool {
    if let Err(err) = state.envs.destroy(id, cpu, &mut state.spaces) {
        log_error!(target: "trap", "destroy {} failed: {}", id, err);
    }
    true
}

fn user_fault(state: &mut KernelState, cpu: CpuId, id: EnvId, fault_va: usize) -> bool {
    match fault::deliver_upcall(&mut state.envs, &mut state.spaces, id, fault_va) {
        Ok(record) => {
            log_trace!(target: "trap", "[{}] upcall va={:#x} err={:#x}", id, record.fault_va, record.err);
            false
        }
        Err(err) => {
            let ip = state.envs.get(id).map(|e| e.frame().ip).unwrap_or(0);
            log_warn!(target: "trap", "[{}] user fault va {:#x} ip {:#x}: {:?}", id, fault_va, ip, err);
            kill(state, cpu, id)
        }
    }
}

fn debug_stop(state: &mut KernelState, platform: &Platform, cpu: CpuId, id: EnvId) -> bool {
    let Ok(env) = state.envs.get(id) else {
        return true;
    };
    let action = platform.monitor.breakpoint(cpu, Some(id), env.frame());
    match action {
        DebugAction::Continue | DebugAction::Step => {
            if let Ok(env) = state.envs.get_mut(id) {
                let mut flags = Eflags::from_bits_retain(env.frame.flags);
                flags.set(Eflags::TRAP, action == DebugAction::Step);
                env.frame.flags = flags.bits();
            }
            false
        }
        DebugAction::Kill => {
            log_info!(target: "trap", "[{}] killed from monitor", id);
            kill(state, cpu, id)
        }
    }
}

fn syscall(state: &mut KernelState, platform: &Platform, syscalls: &SyscallTable, cpu: CpuId, caller: EnvId) -> bool {
    let Ok(env) = state.envs.get(caller) else {
        return true;
    };
    let number = env.frame().syscall_number();
    let args = env.frame().syscall_args();
    let mut ctx = api::Context::new(
        cpu,
        caller,
        &mut state.envs,
        &mut state.spaces,
        &*platform.console,
        &*platform.cycles,
    );
    let result = syscalls.dispatch(number, &mut ctx, &args);
    let resched = ctx.reschedule;
    if let Err(err) = result {
        log_debug!(target: "syscall", "[{}] syscall {} -> {}", caller, number, err);
    }
    if let Ok(env) = state.envs.get_mut(caller) {
        env.frame.set_ret(encode_result(result));
    }
    resched
}
