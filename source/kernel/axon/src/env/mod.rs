// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment table and lifecycle state machine
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (tests_prop.rs)
//! PUBLIC API: EnvTable (allocate/lookup/destroy/set_status), Env, IpcState, IpcQueue, Outgoing, EnvError
//! DEPENDS_ON: mm::AddressSpaceManager, trap::TrapFrame, axon_abi::{EnvId, EnvStatus, EnvType}
//! INVARIANTS: (index, generation) ids are never reused while live; lookups verify the generation;
//!             slots return to the head of the free list; a freed environment owns no address space
//!             and appears in no peer's waiting count

use alloc::vec::Vec;
use core::fmt;

use axon_abi::layout::USTACKTOP;
use axon_abi::{EnvId, EnvInfo, EnvStatus, EnvType, ErrorCode, PageFlags, LOG2NENV, NENV};
use spin::Mutex;

use crate::mm::{AddressSpaceManager, AsHandle};
use crate::trap::TrapFrame;
use crate::types::CpuId;

#[cfg(test)]
mod tests_prop;

/// Errors returned by table operations.
#[must_use = "environment errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Id does not name a live environment, or the caller may not touch it.
    BadEnvironment,
    /// Every slot is in use.
    NoFreeSlot,
    /// The address space could not be created.
    OutOfMemory,
    /// Requested status is not a valid state.
    InvalidStatus,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Receive-side IPC fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcState {
    pub recving: bool,
    pub dstva: usize,
    pub value: usize,
    pub from: EnvId,
    pub perm: PageFlags,
}

/// A message parked by a queued sender until the target fetches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing {
    pub to: EnvId,
    pub value: usize,
    pub srcva: usize,
    pub perm: PageFlags,
}

/// Queued-IPC state guarded by the per-environment lock.
#[derive(Debug, Default)]
pub struct IpcQueue {
    /// Senders currently parked on this environment.
    pub waiting: u32,
    /// Set while this environment is blocked in a queued send.
    pub outbox: Option<Outgoing>,
}

impl IpcQueue {
    pub fn sending(&self) -> bool {
        self.outbox.is_some()
    }
}

/// One environment record.
pub struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent: EnvId,
    pub(crate) env_type: EnvType,
    pub(crate) status: EnvStatus,
    pub(crate) runs: u32,
    pub(crate) cpu: Option<CpuId>,
    pub(crate) address_space: Option<AsHandle>,
    pub(crate) pgfault_upcall: usize,
    pub(crate) frame: TrapFrame,
    pub(crate) ipc: IpcState,
    pub(crate) queue: Mutex<IpcQueue>,
    next_free: Option<usize>,
}

impl Env {
    fn vacant(next_free: Option<usize>) -> Self {
        Self {
            id: EnvId::SELF,
            parent: EnvId::SELF,
            env_type: EnvType::User,
            status: EnvStatus::Free,
            runs: 0,
            cpu: None,
            address_space: None,
            pgfault_upcall: 0,
            frame: TrapFrame::default(),
            ipc: IpcState::default(),
            queue: Mutex::new(IpcQueue::default()),
            next_free,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> EnvId {
        self.parent
    }

    pub fn env_type(&self) -> EnvType {
        self.env_type
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    pub fn address_space(&self) -> Option<AsHandle> {
        self.address_space
    }

    pub fn pgfault_upcall(&self) -> usize {
        self.pgfault_upcall
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn ipc(&self) -> &IpcState {
        &self.ipc
    }

    /// Per-environment lock for queued IPC.
    pub fn queue(&self) -> &Mutex<IpcQueue> {
        &self.queue
    }

    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }

    /// Read-only view exported to user space and the monitor.
    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent: self.parent,
            env_type: self.env_type,
            status: self.status,
            runs: self.runs,
            ipc_recving: self.ipc.recving,
            ipc_from: self.ipc.from,
            ipc_value: self.ipc.value,
            ipc_perm: self.ipc.perm,
        }
    }
}

/// What `destroy` did with the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The slot is back on the free list.
    Freed,
    /// Running on another CPU; marked DYING and freed at its next trap.
    Deferred,
}

/// Generation for the next occupant of a slot whose previous id was `prev`.
fn next_id(prev: EnvId, index: usize) -> EnvId {
    let step = 1u32 << LOG2NENV;
    let mut generation = prev.as_raw().wrapping_add(step) & !(NENV as u32 - 1);
    if generation == 0 || generation > i32::MAX as u32 {
        generation = step;
    }
    EnvId::from_raw(generation | index as u32)
}

/// Fixed arena of environments with a LIFO free list.
pub struct EnvTable {
    slots: Vec<Env>,
    free_head: Option<usize>,
    live: usize,
}

static_assertions::assert_impl_all!(EnvTable: Send);
static_assertions::assert_not_impl_any!(EnvTable: Clone);

impl EnvTable {
    /// Creates a table with `capacity` slots (clamped to `NENV`), slot 0 at the free-list head.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(NENV);
        let slots = (0..capacity)
            .map(|i| Env::vacant(if i + 1 < capacity { Some(i + 1) } else { None }))
            .collect();
        Self { slots, free_head: if capacity > 0 { Some(0) } else { None }, live: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of non-free slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Claims the free-list head for a new user environment.
    pub fn allocate(
        &mut self,
        parent: EnvId,
        spaces: &mut AddressSpaceManager,
    ) -> Result<EnvId, EnvError> {
        self.allocate_as(parent, EnvType::User, spaces)
    }

    /// Claims the free-list head for a new environment of `env_type`.
    pub fn allocate_as(
        &mut self,
        parent: EnvId,
        env_type: EnvType,
        spaces: &mut AddressSpaceManager,
    ) -> Result<EnvId, EnvError> {
        let index = self.free_head.ok_or(EnvError::NoFreeSlot)?;
        let handle = spaces.create().map_err(|_| EnvError::OutOfMemory)?;
        let env = &mut self.slots[index];
        self.free_head = env.next_free.take();
        env.id = next_id(env.id, index);
        env.parent = parent;
        env.env_type = env_type;
        env.status = EnvStatus::Runnable;
        env.runs = 0;
        env.cpu = None;
        env.address_space = Some(handle);
        env.pgfault_upcall = 0;
        env.frame = TrapFrame::user(0, USTACKTOP);
        env.ipc = IpcState::default();
        *env.queue.get_mut() = IpcQueue::default();
        self.live += 1;
        log_debug!(target: "env", "alloc {} parent={} type={:?}", env.id, parent, env_type);
        Ok(env.id)
    }

    /// Slot by index, free or not.
    pub fn slot(&self, index: usize) -> Option<&Env> {
        self.slots.get(index)
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut Env> {
        self.slots.get_mut(index)
    }

    /// Live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().filter(|e| !e.is_free())
    }

    /// Resolves `id` (0 = `caller`) to a live id.
    ///
    /// With `checked`, the target must be the caller or one of its children.
    pub fn resolve(&self, id: EnvId, caller: Option<EnvId>, checked: bool) -> Result<EnvId, EnvError> {
        let id = if id.is_self() { caller.ok_or(EnvError::BadEnvironment)? } else { id };
        let env = self.get(id)?;
        if checked {
            let caller = caller.ok_or(EnvError::BadEnvironment)?;
            if env.id != caller && env.parent != caller {
                return Err(EnvError::BadEnvironment);
            }
        }
        Ok(env.id)
    }

    /// Resolves and borrows; see [`EnvTable::resolve`].
    pub fn lookup(&self, id: EnvId, caller: Option<EnvId>, checked: bool) -> Result<&Env, EnvError> {
        let id = self.resolve(id, caller, checked)?;
        self.get(id)
    }

    /// Exact-id access; fails on free slots and stale generations.
    pub fn get(&self, id: EnvId) -> Result<&Env, EnvError> {
        match self.slots.get(id.index()) {
            Some(env) if !env.is_free() && env.id == id => Ok(env),
            _ => Err(EnvError::BadEnvironment),
        }
    }

    pub fn get_mut(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        match self.slots.get_mut(id.index()) {
            Some(env) if !env.is_free() && env.id == id => Ok(env),
            _ => Err(EnvError::BadEnvironment),
        }
    }

    /// Sets the status of a live environment.
    ///
    /// `Free` goes through reclamation so the slot and address space are released.
    pub fn set_status(
        &mut self,
        id: EnvId,
        status: EnvStatus,
        spaces: &mut AddressSpaceManager,
    ) -> Result<(), EnvError> {
        if status == EnvStatus::Free {
            return self.free(id, spaces);
        }
        let env = self.get_mut(id)?;
        if status != EnvStatus::Running {
            env.cpu = None;
        }
        env.status = status;
        Ok(())
    }

    /// Destroys `id` on behalf of `cpu`.
    pub fn destroy(
        &mut self,
        id: EnvId,
        cpu: CpuId,
        spaces: &mut AddressSpaceManager,
    ) -> Result<Reclaim, EnvError> {
        let env = self.get_mut(id)?;
        if env.status == EnvStatus::Running && env.cpu.is_some_and(|c| c != cpu) {
            env.status = EnvStatus::Dying;
            log_info!(target: "env", "{} running on cpu {:?}; marked dying", id, env.cpu);
            return Ok(Reclaim::Deferred);
        }
        self.free(id, spaces)?;
        Ok(Reclaim::Freed)
    }

    /// Releases everything `id` owns and puts the slot at the free-list head.
    pub fn free(&mut self, id: EnvId, spaces: &mut AddressSpaceManager) -> Result<(), EnvError> {
        let index = self.get(id)?.id.index();
        let outbox = self.slots[index].queue.get_mut().outbox.take();
        if let Some(out) = outbox {
            if let Ok(target) = self.get(out.to) {
                let mut q = target.queue.lock();
                q.waiting = q.waiting.saturating_sub(1);
            }
        }
        if self.slots[index].queue.get_mut().waiting > 0 {
            self.wake_senders_of(id);
        }
        let env = &mut self.slots[index];
        if let Some(handle) = env.address_space.take() {
            if spaces.destroy(handle).is_err() {
                log_error!(target: "env", "{}: address space already gone", id);
            }
        }
        log_info!(target: "env", "free {} (runs={})", id, env.runs);
        env.status = EnvStatus::Free;
        env.cpu = None;
        env.pgfault_upcall = 0;
        env.frame = TrapFrame::default();
        env.ipc = IpcState::default();
        *env.queue.get_mut() = IpcQueue::default();
        env.next_free = self.free_head;
        self.free_head = Some(index);
        self.live -= 1;
        Ok(())
    }

    /// Fails every queued send aimed at `target` with `BadEnvironment`.
    fn wake_senders_of(&mut self, target: EnvId) {
        for env in self.slots.iter_mut().filter(|e| !e.is_free()) {
            let parked = env.queue.get_mut();
            if parked.outbox.is_some_and(|out| out.to == target) {
                parked.outbox = None;
                env.frame.set_ret(ErrorCode::BadEnvironment.as_return() as usize);
                env.status = EnvStatus::Runnable;
                log_debug!(target: "env", "{} woken: target {} destroyed", env.id, target);
            }
        }
    }

    /// Snapshot of every live environment.
    pub fn infos(&self) -> Vec<EnvInfo> {
        self.iter().map(Env::info).collect()
    }
}
