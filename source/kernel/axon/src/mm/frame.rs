// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frame pool.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use super::PAGE_SIZE;

static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Physical frame number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{}", self.0)
    }
}

#[derive(Default)]
struct Frame {
    refs: u32,
    allocated: bool,
    // Materialised on first write; absent means all zero.
    data: Option<Box<[u8; PAGE_SIZE]>>,
}

/// Fixed pool of frames with a LIFO free list.
pub struct FramePool {
    frames: Vec<Frame>,
    free: Vec<u32>,
    #[cfg(any(test, feature = "failpoints"))]
    deny_next: bool,
}

impl FramePool {
    pub fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, Frame::default);
        // lowest frame number is handed out first
        let free = (0..count as u32).rev().collect();
        Self {
            frames,
            free,
            #[cfg(any(test, feature = "failpoints"))]
            deny_next: false,
        }
    }

    /// Takes a zero-filled frame with a reference count of zero.
    pub fn alloc_zeroed(&mut self) -> Option<FrameNumber> {
        #[cfg(any(test, feature = "failpoints"))]
        if core::mem::take(&mut self.deny_next) {
            return None;
        }
        let raw = self.free.pop()?;
        let frame = &mut self.frames[raw as usize];
        frame.allocated = true;
        frame.refs = 0;
        frame.data = None;
        Some(FrameNumber(raw))
    }

    pub fn incref(&mut self, frame: FrameNumber) {
        let slot = &mut self.frames[frame.as_index()];
        debug_assert!(slot.allocated, "incref on free frame {}", frame);
        slot.refs += 1;
    }

    /// Drops one reference; the frame returns to the pool when none remain.
    pub fn decref(&mut self, frame: FrameNumber) {
        let slot = &mut self.frames[frame.as_index()];
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.release(frame);
        }
    }

    /// Returns a frame that was allocated but never referenced.
    pub fn release_unused(&mut self, frame: FrameNumber) {
        if self.frames[frame.as_index()].refs == 0 {
            self.release(frame);
        }
    }

    fn release(&mut self, frame: FrameNumber) {
        let slot = &mut self.frames[frame.as_index()];
        if !slot.allocated {
            return;
        }
        slot.allocated = false;
        slot.data = None;
        self.free.push(frame.0);
    }

    pub fn refs(&self, frame: FrameNumber) -> u32 {
        self.frames.get(frame.as_index()).map_or(0, |f| f.refs)
    }

    pub fn bytes(&self, frame: FrameNumber) -> &[u8; PAGE_SIZE] {
        match &self.frames[frame.as_index()].data {
            Some(data) => &**data,
            None => &ZERO_PAGE,
        }
    }

    pub fn bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8; PAGE_SIZE] {
        self.frames[frame.as_index()].data.get_or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn deny_next_alloc(&mut self) {
        self.deny_next = true;
    }
}
