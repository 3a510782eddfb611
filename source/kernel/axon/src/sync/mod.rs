// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Synchronization primitives.

pub mod kernel_lock;

pub use kernel_lock::{KernelGuard, KernelLock};
