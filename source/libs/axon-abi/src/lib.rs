// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the axon kernel core and userland
//! OWNERS: @runtime
//! PUBLIC API: EnvId, EnvStatus, EnvType, ErrorCode, PageFlags, FaultCode, Regs, FaultRecord, EnvInfo,
//!             syscall::*, layout::*, trap::*
//! DEPENDS_ON: bitflags, static_assertions
//! INVARIANTS: Syscall numbers and error codes are stable; FaultRecord is WORDS little-endian
//!             machine words in declaration order (writer and trampoline must agree)

use core::fmt;

/// Stable syscall numbers.
pub mod syscall {
    /// Writes a user buffer to the console.
    pub const CPUTS: usize = 0;
    /// Reads one console byte without blocking (0 when none pending).
    pub const CGETC: usize = 1;
    /// Returns the caller's environment id.
    pub const GETENVID: usize = 2;
    /// Destroys an environment (0 = self).
    pub const ENV_DESTROY: usize = 3;
    /// Gives up the CPU.
    pub const YIELD: usize = 4;
    /// Clones the caller into a new NOT_RUNNABLE environment.
    pub const EXOFORK: usize = 5;
    /// Sets the status of an environment.
    pub const ENV_SET_STATUS: usize = 6;
    /// Allocates and maps a zeroed page.
    pub const PAGE_ALLOC: usize = 7;
    /// Maps a page of one environment into another.
    pub const PAGE_MAP: usize = 8;
    /// Removes a page mapping.
    pub const PAGE_UNMAP: usize = 9;
    /// Registers the page-fault upcall entry point.
    pub const ENV_SET_PGFAULT_UPCALL: usize = 10;
    /// Logs the caller's mappings and returns how many are present.
    pub const PAGING_SCAN: usize = 11;
    /// Polling IPC send (fails when the target is not receiving).
    pub const IPC_TRY_SEND: usize = 12;
    /// Blocking IPC receive.
    pub const IPC_RECV: usize = 13;
    /// Queued IPC send (blocks until fetched).
    pub const IPC_SEND_QUEUED: usize = 14;
    /// Queued IPC receive (fetches a waiting sender first).
    pub const IPC_RECV_QUEUED: usize = 15;
}

/// Virtual memory layout shared by kernel and user code.
pub mod layout {
    /// Size of a page in bytes.
    pub const PAGE_SIZE: usize = 4096;
    /// Bytes covered by one page-table page (one directory entry).
    pub const PT_SPAN: usize = 1024 * PAGE_SIZE;
    /// Top of user-controlled memory; nothing at or above is transferable.
    pub const UTOP: usize = 0xEEC0_0000;
    /// Top of the one-page user exception stack.
    pub const UXSTACKTOP: usize = UTOP;
    /// Top of the normal user stack (one guard page below the exception stack).
    pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
    /// Scratch region used by user code for temporary mappings.
    pub const UTEMP: usize = 0x0040_0000;
    /// Scratch page used by the copy-on-write fault handler.
    pub const PFTEMP: usize = UTEMP + PT_SPAN - PAGE_SIZE;
    /// Base of user program text.
    pub const UTEXT: usize = 0x0080_0000;

    /// Rounds `va` down to its page base.
    #[inline]
    pub const fn page_base(va: usize) -> usize {
        va & !(PAGE_SIZE - 1)
    }

    /// Returns true when `va` is page aligned.
    #[inline]
    pub const fn is_page_aligned(va: usize) -> bool {
        va % PAGE_SIZE == 0
    }
}

/// Trap vectors and frame flag bits.
pub mod trap {
    /// Single-step / debug exception.
    pub const T_DEBUG: usize = 1;
    /// Breakpoint instruction.
    pub const T_BRKPT: usize = 3;
    /// General protection fault.
    pub const T_GPFLT: usize = 13;
    /// Page fault.
    pub const T_PGFLT: usize = 14;
    /// Timer interrupt.
    pub const T_TIMER: usize = 32;
    /// Software syscall vector.
    pub const T_SYSCALL: usize = 48;

    /// Trap flag: single-step after the next instruction.
    pub const FL_TF: usize = 0x100;
    /// Interrupts enabled.
    pub const FL_IF: usize = 0x200;
}

/// Number of index bits in an environment id.
pub const LOG2NENV: u32 = 10;
/// Upper bound on environment table capacity.
pub const NENV: usize = 1 << LOG2NENV;

/// Environment identifier: table index in the low bits, generation above.
///
/// Raw value 0 is never a live id; syscalls interpret it as "the caller".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Placeholder meaning "the calling environment".
    pub const SELF: Self = Self(0);

    /// Wraps a raw id.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Decodes an id the kernel handed back in a return register.
    #[inline]
    pub const fn from_word(word: usize) -> Self {
        Self(word as u32)
    }

    /// Decodes an untrusted id word; anything outside the non-negative `i32` range is rejected.
    #[inline]
    pub const fn try_from_word(word: usize) -> Option<Self> {
        if word > i32::MAX as usize {
            None
        } else {
            Some(Self(word as u32))
        }
    }

    /// Builds an id from its slot index and generation.
    #[inline]
    pub const fn from_parts(index: usize, generation: u32) -> Self {
        Self((generation << LOG2NENV) | (index as u32 & (NENV as u32 - 1)))
    }

    /// Returns the raw id.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the id as a syscall register word.
    #[inline]
    pub const fn as_word(self) -> usize {
        self.0 as usize
    }

    /// Table slot addressed by this id.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Generation ("uniqueifier") of this id.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> LOG2NENV
    }

    /// True for the "caller" placeholder.
    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum EnvStatus {
    /// Slot is on the free list.
    Free = 0,
    /// Destroyed while running elsewhere; freed at its next trap.
    Dying = 1,
    /// Ready to be dispatched.
    Runnable = 2,
    /// Currently executing on some CPU.
    Running = 3,
    /// Blocked (IPC) or not yet started.
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a status word; `None` for anything outside the five states.
    pub const fn from_word(word: usize) -> Option<Self> {
        match word {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    /// Status as a syscall register word.
    #[inline]
    pub const fn as_word(self) -> usize {
        self as usize
    }
}

/// Role of an environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum EnvType {
    /// Ordinary user environment.
    User = 0,
    /// Per-CPU idle environment.
    Idle = 1,
    /// File-system server.
    FileServer = 2,
    /// Network server.
    NetServer = 3,
}

/// Error codes returned (negated) by syscalls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(isize)]
pub enum ErrorCode {
    /// Unknown, stale, or unauthorized environment id.
    BadEnvironment = 1,
    /// Malformed address, permission, status, or syscall number.
    InvalidArgument = 2,
    /// Frame or page-table allocation failed.
    OutOfMemory = 3,
    /// Environment table is full.
    NoFreeSlot = 4,
    /// IPC target is not blocked in receive.
    IpcNotReceiving = 5,
}

impl ErrorCode {
    /// Returns the negative word placed in the syscall return register.
    #[inline]
    pub const fn as_return(self) -> isize {
        -(self as isize)
    }

    /// Maps a negative return value back to its code.
    pub const fn from_return(ret: isize) -> Option<Self> {
        match ret {
            -1 => Some(Self::BadEnvironment),
            -2 => Some(Self::InvalidArgument),
            -3 => Some(Self::OutOfMemory),
            -4 => Some(Self::NoFreeSlot),
            -5 => Some(Self::IpcNotReceiving),
            _ => None,
        }
    }

    /// Splits a raw syscall return into a value or an error code.
    ///
    /// Negative values outside the table are reported as `InvalidArgument`.
    pub fn check(ret: isize) -> Result<usize, Self> {
        if ret >= 0 {
            Ok(ret as usize)
        } else {
            Err(Self::from_return(ret).unwrap_or(Self::InvalidArgument))
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

bitflags::bitflags! {
    /// Page-table permission bits visible to user code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: usize {
        /// Mapping is present.
        const PRESENT = 0x001;
        /// Mapping is writable.
        const WRITABLE = 0x002;
        /// Mapping is accessible from user mode.
        const USER = 0x004;
        /// Bits reserved for software use.
        const AVAIL = 0xE00;
        /// Software bit marking a copy-on-write page.
        const COW = 0x800;
        /// Every bit a syscall may request.
        const SYSCALL = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits() | Self::AVAIL.bits();
    }
}

bitflags::bitflags! {
    /// Page-fault error bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FaultCode: usize {
        /// Protection violation (page was present).
        const PROTECTION = 0x1;
        /// Faulting access was a write.
        const WRITE = 0x2;
        /// Fault happened in user mode.
        const USER = 0x4;
    }
}

/// Number of general purpose registers in a saved context.
pub const NREGS: usize = 8;
/// Register carrying the syscall number on entry and the result on exit.
pub const REG_RET: usize = 0;
/// First syscall argument register; arguments occupy `REG_ARG0..REG_ARG0 + 5`.
pub const REG_ARG0: usize = 1;

/// General purpose register snapshot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Regs {
    /// Register file.
    pub r: [usize; NREGS],
}

/// Fault context pushed on the user exception stack before an upcall.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultRecord {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Error bits (`FaultCode` for page faults, the trap error word otherwise).
    pub err: usize,
    /// Registers at the time of the fault.
    pub regs: Regs,
    /// Instruction pointer at the time of the fault.
    pub ip: usize,
    /// Flags at the time of the fault.
    pub flags: usize,
    /// Stack pointer at the time of the fault.
    pub sp: usize,
}

const WORD: usize = core::mem::size_of::<usize>();

impl FaultRecord {
    /// Number of machine words in the encoded record.
    pub const WORDS: usize = 2 + NREGS + 3;
    /// Encoded size in bytes.
    pub const SIZE: usize = Self::WORDS * WORD;

    fn words(&self) -> [usize; Self::WORDS] {
        let mut out = [0usize; Self::WORDS];
        out[0] = self.fault_va;
        out[1] = self.err;
        out[2..2 + NREGS].copy_from_slice(&self.regs.r);
        out[2 + NREGS] = self.ip;
        out[3 + NREGS] = self.flags;
        out[4 + NREGS] = self.sp;
        out
    }

    /// Serialises the record as little-endian words.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(WORD).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Parses a record written by [`FaultRecord::encode`]; `None` if `bytes` is short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut words = [0usize; Self::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD)) {
            let mut raw = [0u8; WORD];
            raw.copy_from_slice(chunk);
            *word = usize::from_le_bytes(raw);
        }
        let mut regs = Regs::default();
        regs.r.copy_from_slice(&words[2..2 + NREGS]);
        Some(Self {
            fault_va: words[0],
            err: words[1],
            regs,
            ip: words[2 + NREGS],
            flags: words[3 + NREGS],
            sp: words[4 + NREGS],
        })
    }
}

static_assertions::const_assert_eq!(FaultRecord::SIZE, core::mem::size_of::<FaultRecord>());

/// Read-only view of an environment record, as exported to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    /// Environment id.
    pub id: EnvId,
    /// Parent id (`EnvId::SELF` when none).
    pub parent: EnvId,
    /// Role.
    pub env_type: EnvType,
    /// Current status.
    pub status: EnvStatus,
    /// Number of times the environment was dispatched.
    pub runs: u32,
    /// Blocked in receive.
    pub ipc_recving: bool,
    /// Sender of the last delivered message.
    pub ipc_from: EnvId,
    /// Value of the last delivered message.
    pub ipc_value: usize,
    /// Permission of the page delivered with the last message (empty if none).
    pub ipc_perm: PageFlags,
}
