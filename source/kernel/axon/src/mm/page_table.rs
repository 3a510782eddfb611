// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level user page table keyed by page and directory span.

use alloc::collections::BTreeMap;

use axon_abi::layout::{PT_SPAN, UTOP};

use super::frame::FrameNumber;
use super::{PageFlags, PAGE_SIZE};

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address lies outside the user range.
    OutOfRange,
    /// Flags do not describe a present mapping.
    InvalidFlags,
    /// No page-table page covers the address.
    MissingTable,
}

/// A leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub frame: FrameNumber,
    pub flags: PageFlags,
}

#[inline]
pub const fn span_base(va: usize) -> usize {
    va & !(PT_SPAN - 1)
}

/// Leaf entries plus the frames backing each directory span.
#[derive(Debug, Default)]
pub struct PageTable {
    tables: BTreeMap<usize, FrameNumber>,
    entries: BTreeMap<usize, Mapping>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that `va` and `flags` can describe a user leaf entry.
    pub fn validate(va: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if va >= UTOP {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        Ok(())
    }

    pub fn has_table(&self, va: usize) -> bool {
        self.tables.contains_key(&span_base(va))
    }

    /// Records the frame backing the directory span of `va`.
    pub fn install_table(&mut self, va: usize, frame: FrameNumber) {
        self.tables.insert(span_base(va), frame);
    }

    pub fn lookup(&self, va: usize) -> Option<Mapping> {
        self.entries.get(&(va & !(PAGE_SIZE - 1))).copied()
    }

    /// Installs `mapping` at `va`, returning the entry it replaced.
    pub fn map(&mut self, va: usize, mapping: Mapping) -> Result<Option<Mapping>, MapError> {
        Self::validate(va, mapping.flags)?;
        if !self.has_table(va) {
            return Err(MapError::MissingTable);
        }
        Ok(self.entries.insert(va, mapping))
    }

    pub fn unmap(&mut self, va: usize) -> Option<Mapping> {
        self.entries.remove(&(va & !(PAGE_SIZE - 1)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Mapping)> + '_ {
        self.entries.iter().map(|(va, m)| (*va, *m))
    }

    pub fn tables(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.tables.values().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
