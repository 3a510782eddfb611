// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space management backed by the frame pool.

use alloc::vec::Vec;
use core::num::NonZeroU32;

use axon_abi::FaultCode;

use super::frame::{FrameNumber, FramePool};
use super::page_table::{MapError, Mapping, PageTable};
use super::{PageFlags, PAGE_SIZE};

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    fn from_index(index: usize) -> Self {
        Self(NonZeroU32::MIN.saturating_add(index as u32))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    InvalidHandle,
    /// No frame was available for a page or page-table page.
    OutOfMemory,
    /// Underlying map operation failed.
    Mapping(MapError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

/// A user-mode access that the MMU would refuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessFault {
    pub va: usize,
    pub code: FaultCode,
}

struct AddressSpace {
    root: FrameNumber,
    table: PageTable,
}

/// Owns every user address space and the frames behind them.
pub struct AddressSpaceManager {
    spaces: Vec<Option<AddressSpace>>,
    frames: FramePool,
    invalidations: u64,
    #[cfg(any(test, feature = "failpoints"))]
    deny_next_map: bool,
}

impl AddressSpaceManager {
    pub fn new(frames: usize) -> Self {
        Self {
            spaces: Vec::new(),
            frames: FramePool::new(frames),
            invalidations: 0,
            #[cfg(any(test, feature = "failpoints"))]
            deny_next_map: false,
        }
    }

    /// Allocates an empty address space (one frame for the root table).
    pub fn create(&mut self) -> Result<AsHandle, AddressSpaceError> {
        let root = self.frames.alloc_zeroed().ok_or(AddressSpaceError::OutOfMemory)?;
        self.frames.incref(root);
        let space = AddressSpace { root, table: PageTable::new() };
        let index = match self.spaces.iter().position(Option::is_none) {
            Some(index) => {
                self.spaces[index] = Some(space);
                index
            }
            None => {
                self.spaces.push(Some(space));
                self.spaces.len() - 1
            }
        };
        Ok(AsHandle::from_index(index))
    }

    /// Drops every mapping, the page-table pages and the root.
    pub fn destroy(&mut self, handle: AsHandle) -> Result<(), AddressSpaceError> {
        let space = self
            .spaces
            .get_mut(handle.index())
            .and_then(Option::take)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        for (_, mapping) in space.table.iter() {
            self.frames.decref(mapping.frame);
        }
        for table in space.table.tables() {
            self.frames.decref(table);
        }
        self.frames.decref(space.root);
        self.invalidations += 1;
        Ok(())
    }

    fn space(&self, handle: AsHandle) -> Result<&AddressSpace, AddressSpaceError> {
        self.spaces
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    fn space_mut(&mut self, handle: AsHandle) -> Result<&mut AddressSpace, AddressSpaceError> {
        self.spaces
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Physical binding of `va`; `Ok(None)` when nothing is mapped.
    pub fn lookup(&self, handle: AsHandle, va: usize) -> Result<Option<Mapping>, AddressSpaceError> {
        Ok(self.space(handle)?.table.lookup(va))
    }

    /// Maps an existing frame at `va`, replacing whatever was there.
    pub fn insert(
        &mut self,
        handle: AsHandle,
        frame: FrameNumber,
        va: usize,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        #[cfg(any(test, feature = "failpoints"))]
        if core::mem::take(&mut self.deny_next_map) {
            return Err(AddressSpaceError::OutOfMemory);
        }
        PageTable::validate(va, flags)?;
        let needs_table = !self.space(handle)?.table.has_table(va);
        if needs_table {
            let table = self.frames.alloc_zeroed().ok_or(AddressSpaceError::OutOfMemory)?;
            self.frames.incref(table);
            self.space_mut(handle)?.table.install_table(va, table);
        }
        // Take the new reference first so re-inserting the same frame cannot free it.
        self.frames.incref(frame);
        let replaced = match self.space_mut(handle)?.table.map(va, Mapping { frame, flags }) {
            Ok(replaced) => replaced,
            Err(err) => {
                self.frames.decref(frame);
                return Err(err.into());
            }
        };
        if let Some(old) = replaced {
            self.frames.decref(old.frame);
            self.invalidate(handle, va);
        }
        Ok(())
    }

    /// Allocates a zeroed frame and maps it at `va`.
    pub fn alloc_page(
        &mut self,
        handle: AsHandle,
        va: usize,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        self.space(handle)?;
        let frame = self.frames.alloc_zeroed().ok_or(AddressSpaceError::OutOfMemory)?;
        if let Err(err) = self.insert(handle, frame, va, flags) {
            self.frames.release_unused(frame);
            return Err(err);
        }
        Ok(())
    }

    /// Removes the mapping at `va`; absent mappings are not an error.
    pub fn remove(&mut self, handle: AsHandle, va: usize) -> Result<Option<Mapping>, AddressSpaceError> {
        let removed = self.space_mut(handle)?.table.unmap(va);
        if let Some(old) = removed {
            self.frames.decref(old.frame);
            self.invalidate(handle, va);
        }
        Ok(removed)
    }

    /// Drops cached translations for `va`.
    pub fn invalidate(&mut self, _handle: AsHandle, _va: usize) {
        self.invalidations += 1;
    }

    /// Iterates over the present user mappings of `handle` in address order.
    pub fn mappings(
        &self,
        handle: AsHandle,
    ) -> Result<impl Iterator<Item = (usize, Mapping)> + '_, AddressSpaceError> {
        Ok(self.space(handle)?.table.iter())
    }

    /// Whether any page-table page covers the directory span of `va`.
    pub fn span_present(&self, handle: AsHandle, va: usize) -> Result<bool, AddressSpaceError> {
        Ok(self.space(handle)?.table.has_table(va))
    }

    fn translate(
        &self,
        handle: AsHandle,
        va: usize,
        write: bool,
    ) -> Result<FrameNumber, AccessFault> {
        let mut code = FaultCode::USER;
        if write {
            code |= FaultCode::WRITE;
        }
        let mapping = match self.space(handle).ok().and_then(|s| s.table.lookup(va)) {
            Some(m) => m,
            None => return Err(AccessFault { va, code }),
        };
        let mut need = PageFlags::PRESENT | PageFlags::USER;
        if write {
            need |= PageFlags::WRITABLE;
        }
        if mapping.flags.contains(need) {
            Ok(mapping.frame)
        } else {
            Err(AccessFault { va, code: code | FaultCode::PROTECTION })
        }
    }

    /// Checks that user mode may access `[va, va + len)`.
    pub fn check_user(&self, handle: AsHandle, va: usize, len: usize, write: bool) -> Result<(), AccessFault> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(AccessFault { va, code: FaultCode::USER })?;
        let mut page = va & !(PAGE_SIZE - 1);
        while page < end {
            let probe = page.max(va);
            self.translate(handle, probe, write)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies user memory into `buf` with user-mode permission checks.
    pub fn read_user(&self, handle: AsHandle, va: usize, buf: &mut [u8]) -> Result<(), AccessFault> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let frame = self.translate(handle, addr, false)?;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(&self.frames.bytes(frame)[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into user memory with user-mode permission checks.
    ///
    /// Pages before the first faulting page are written, as on hardware.
    pub fn write_user(&mut self, handle: AsHandle, va: usize, data: &[u8]) -> Result<(), AccessFault> {
        let mut done = 0;
        while done < data.len() {
            let addr = va + done;
            let frame = self.translate(handle, addr, true)?;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            self.frames.bytes_mut(frame)[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn frame_refs(&self, frame: FrameNumber) -> u32 {
        self.frames.refs(frame)
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.capacity()
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    pub fn root(&self, handle: AsHandle) -> Option<FrameNumber> {
        self.space(handle).ok().map(|s| s.root)
    }

    /// Makes the next frame allocation fail.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn deny_next_alloc(&mut self) {
        self.frames.deny_next_alloc();
    }

    /// Makes the next `insert` fail with `OutOfMemory`.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn deny_next_map(&mut self) {
        self.deny_next_map = true;
    }
}
