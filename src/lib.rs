//! # Scoria
//!
//! Lifecycle management for GPU command lists.
//!
//! Scoria pairs each native command list with the allocator its commands are recorded
//! into, and drives the pair through a strict close / submit / reset protocol. Native
//! failures during that protocol are treated as fatal by default, with `try_` variants
//! for callers that want to handle device loss.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::backend::mock::{Mock, MockDevice};
//! use scoria::prelude::*;
//!
//! let device = MockDevice::new();
//! let mut queue = device.create_queue(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
//!
//! let mut list = CommandList::<Mock>::new_direct(&device);
//! list.record(|_list| {
//!     // Record draw and dispatch commands here
//! });
//! list.close();
//! list.submit(&mut queue);
//! ```
//!
//! ## Overview
//!
//! ### Command Lists
//!
//! [`CommandList`] owns one allocator and one command list. Lists are created through
//! [`CommandList::new_direct`] for general purpose work and [`CommandList::new_copy`] for
//! transfer work. Both use a general purpose allocator. See the [`command`] module for
//! the state machine.
//!
//! ### Tracking Work in Flight
//!
//! Resetting a command list reclaims allocator memory the GPU may still be reading.
//! [`Timeline`] tracks GPU progress with a fence counter, and [`CommandListPool`] uses it
//! to recycle lists only after their submissions completed:
//!
//! ```
//! # use scoria::backend::mock::{Mock, MockDevice};
//! # use scoria::prelude::*;
//! # let device = MockDevice::new();
//! let queue = device.create_queue(vk::QueueFlags::TRANSFER);
//! let mut pool = CommandListPool::<Mock>::new(device.clone(), queue, PoolConfig::copy()).unwrap();
//! let mut list = pool.acquire().unwrap();
//! list.close();
//! let ticket = pool.submit(list).unwrap();
//! pool.timeline().wait(ticket, !0).unwrap();
//! pool.reclaim().unwrap();
//! assert_eq!(pool.free_count(), 1);
//! ```
//!
//! ### Backends
//!
//! The native layer is abstracted by the traits in [`backend`]:
//!
//! - [`Vulkan`](backend::vulkan::Vulkan) - command pools and command buffers through `ash`
//! - [`Mock`](backend::mock::Mock) - in-memory simulation for tests
//!
//! ## Feature Flags
//!
//! - `vulkan` (default) - Enables the Vulkan backend
//!
//! ## Logging
//!
//! Scoria emits [`tracing`] events. Lifecycle transitions are logged at `trace`, object
//! creation and recycling at `debug`, and fatal failures at `error` before panicking.

pub mod backend;
pub mod command;
pub mod engine;
pub mod error;
pub mod pool;
pub mod sync;
pub mod utils;

pub use command::{CommandList, CommandListState};
pub use engine::EngineType;
pub use error::{CommandListError, Result};
pub use pool::{CommandListPool, PoolConfig};
pub use sync::{SubmissionTicket, Timeline};

pub use ash;

pub mod prelude {
    pub use crate::{
        CommandList, CommandListError, CommandListPool, CommandListState, EngineType,
        PoolConfig, SubmissionTicket, Timeline, ash,
        ash::vk,
        backend::{Backend, RawCommandList, RawQueue},
        utils::AsVkHandle,
    };
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}
