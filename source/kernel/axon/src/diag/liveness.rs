// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Progress epoch for debugging stalls
//! OWNERS: @kernel-team
//! PUBLIC API: bump(), epoch()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Monotonic; bumped on traps, yields and dispatch

use core::sync::atomic::{AtomicU64, Ordering};

/// Global epoch incremented on meaningful progress (traps, yields, dispatch).
static PROGRESS_EPOCH: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn bump() {
    PROGRESS_EPOCH.fetch_add(1, Ordering::SeqCst);
}

#[inline]
pub fn epoch() -> u64 {
    PROGRESS_EPOCH.load(Ordering::SeqCst)
}
