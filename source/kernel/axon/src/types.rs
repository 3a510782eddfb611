// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for safer syscall decoding
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, CpuId, EnvId (re-export)
//! DEPENDS_ON: axon_abi::layout
//! INVARIANTS: User addresses checked against UTOP; alignment helpers; prevent type confusion

use core::fmt;

use axon_abi::layout::{PAGE_SIZE, UTOP};
pub use axon_abi::EnvId;

/// A virtual address supplied by user space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Accepts only page-aligned addresses below `UTOP`.
    #[inline]
    pub fn user_page(addr: usize) -> Option<Self> {
        if addr < UTOP && addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Logical CPU identifier.
///
/// CPU `n` owns the idle environment in table slot `n`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}
