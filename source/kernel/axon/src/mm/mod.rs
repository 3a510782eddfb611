// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space manager consumed by the environment table, IPC and fork paths
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpaceManager, AsHandle, AddressSpaceError, AccessFault, Mapping, MapError,
//!             FrameNumber, PageFlags, PAGE_SIZE
//! DEPENDS_ON: axon_abi::{PageFlags, layout}
//! INVARIANTS: Frames are reference counted across address spaces; lookups distinguish
//!             "not mapped" (Ok(None)) from invalid handles; every permission change invalidates

pub mod address_space;
pub mod frame;
pub mod page_table;


pub use address_space::{AccessFault, AddressSpaceError, AddressSpaceManager, AsHandle};
pub use axon_abi::layout::PAGE_SIZE;
pub use axon_abi::PageFlags;
pub use frame::FrameNumber;
pub use page_table::{MapError, Mapping};
