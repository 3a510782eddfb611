// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved register state for a trap.

use core::fmt::{self, Write};

use axon_abi::trap::{FL_IF, FL_TF, T_BRKPT, T_DEBUG, T_GPFLT, T_PGFLT, T_SYSCALL, T_TIMER};
use axon_abi::{FaultRecord, Regs, REG_ARG0, REG_RET};

use crate::syscall::Args;

bitflags::bitflags! {
    /// Flag bits the kernel reads or sets in a saved frame.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Eflags: usize {
        const TRAP = FL_TF;
        const INTERRUPT = FL_IF;
    }
}

/// Privilege level the trap came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    User,
    Kernel,
}

/// Full register/flags/instruction-pointer snapshot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: Regs,
    pub ip: usize,
    pub sp: usize,
    pub flags: usize,
    pub trapno: usize,
    pub err: usize,
    /// Faulting address for page faults.
    pub tval: usize,
    pub mode: Mode,
}

impl TrapFrame {
    /// Fresh user context: interrupts enabled, stack at `sp`.
    pub fn user(ip: usize, sp: usize) -> Self {
        Self { ip, sp, flags: Eflags::INTERRUPT.bits(), ..Self::default() }
    }

    /// Loads a syscall request into the registers.
    pub fn set_syscall(&mut self, number: usize, args: [usize; 5]) {
        self.trapno = T_SYSCALL;
        self.regs.r[REG_RET] = number;
        self.regs.r[REG_ARG0..REG_ARG0 + 5].copy_from_slice(&args);
    }

    pub fn syscall_number(&self) -> usize {
        self.regs.r[REG_RET]
    }

    pub fn syscall_args(&self) -> Args {
        let r = &self.regs.r;
        Args::new([r[REG_ARG0], r[REG_ARG0 + 1], r[REG_ARG0 + 2], r[REG_ARG0 + 3], r[REG_ARG0 + 4]])
    }

    /// Value in the return slot, as seen by the resumed program.
    #[inline]
    pub fn ret(&self) -> isize {
        self.regs.r[REG_RET] as isize
    }

    #[inline]
    pub fn set_ret(&mut self, value: usize) {
        self.regs.r[REG_RET] = value;
    }

    /// Fault record describing this frame, as pushed for an upcall.
    pub fn fault_record(&self, fault_va: usize) -> FaultRecord {
        FaultRecord {
            fault_va,
            err: self.err,
            regs: self.regs,
            ip: self.ip,
            flags: self.flags,
            sp: self.sp,
        }
    }
}

pub fn describe_trap(trapno: usize) -> &'static str {
    match trapno {
        0 => "Divide error",
        T_DEBUG => "Debug",
        2 => "Non-Maskable Interrupt",
        T_BRKPT => "Breakpoint",
        4 => "Overflow",
        6 => "Invalid Opcode",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_TIMER => "Timer Interrupt",
        T_SYSCALL => "System call",
        _ => "(unknown trap)",
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " trap=0x{:02x} ({}) mode={:?}", frame.trapno, describe_trap(frame.trapno), frame.mode)?;
    writeln!(f, " ip=0x{:016x} sp=0x{:016x} flags=0x{:x}", frame.ip, frame.sp, frame.flags)?;
    writeln!(f, " err=0x{:x} tval=0x{:016x}", frame.err, frame.tval)?;
    writeln!(f, " regs = {:016x?}", &frame.regs.r)
}
