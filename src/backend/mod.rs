//! Native layer interfaces.
//!
//! The device, queue and driver are external collaborators. This module describes the
//! handful of native calls the command list lifecycle consumes, so the lifecycle can be
//! driven by a real driver ([`vulkan`]) or an in-memory implementation ([`mock`]).
//!
//! Every call reports a [`VkResult`]. Any non-success value is a failure.

use ash::{prelude::VkResult, vk};

use crate::engine::EngineType;

pub mod mock;
#[cfg(feature = "vulkan")]
pub mod vulkan;

/// A family of native objects that work together.
pub trait Backend: Sized + 'static {
    type Device: RawDevice<Self>;
    type Allocator: RawAllocator;
    type CommandList: RawCommandList<Self>;
    type Queue: RawQueue<Self>;
    type Fence: RawFence;
}

/// Creation entry points of a native device.
pub trait RawDevice<B: Backend> {
    /// Allocates backing storage for recorded commands.
    fn create_command_allocator(&self, kind: EngineType) -> VkResult<B::Allocator>;

    /// Creates a command list of the requested engine type, bound to `allocator`.
    ///
    /// The list is returned open for recording.
    fn create_command_list(
        &self,
        engine: EngineType,
        allocator: &mut B::Allocator,
    ) -> VkResult<B::CommandList>;

    /// Creates a fence whose counter starts at zero.
    fn create_fence(&self) -> VkResult<B::Fence>;
}

pub trait RawAllocator {
    /// Reclaims the storage of every command recorded from this allocator.
    ///
    /// Undefined behavior at the driver level if any of those commands are still in flight.
    fn reset(&mut self) -> VkResult<()>;
}

pub trait RawCommandList<B: Backend> {
    /// Makes sure the list accepts commands. No-op if it already does.
    fn open(&mut self) -> VkResult<()>;

    /// Finalizes the list so it can be executed.
    fn close(&mut self) -> VkResult<()>;

    /// Returns the list to the recording state, allocating from `allocator`.
    ///
    /// Legal right after the list was handed to a queue. Previously recorded commands are
    /// kept alive by the allocator until it is reset.
    fn reset(&mut self, allocator: &B::Allocator) -> VkResult<()>;
}

pub trait RawQueue<B: Backend> {
    /// Capabilities of the queue family this queue belongs to.
    fn capabilities(&self) -> vk::QueueFlags;

    /// Returns whether `list`, recorded for `engine`, may be executed on this queue.
    fn supports(&self, _list: &B::CommandList, engine: EngineType) -> bool {
        engine.is_supported_by(self.capabilities())
    }

    /// Schedules a batch of closed command lists for asynchronous execution.
    fn execute(&mut self, lists: &[&B::CommandList]) -> VkResult<()>;

    /// Signals `fence` to `value` once all previously executed work has completed.
    fn signal(&mut self, fence: &B::Fence, value: u64) -> VkResult<()>;
}

/// A monotonically increasing GPU-signaled counter.
pub trait RawFence {
    /// The last value the GPU signaled.
    fn completed_value(&self) -> VkResult<u64>;

    /// Blocks the current thread until the counter reaches `value`.
    ///
    /// Returns `Err(vk::Result::TIMEOUT)` if `timeout_ns` elapsed first.
    fn wait(&self, value: u64, timeout_ns: u64) -> VkResult<()>;
}
