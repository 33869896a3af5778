//! # Command Lists
//!
//! A [`CommandList`] owns one native command allocator and one native command list as a
//! unit, and drives them through a strict protocol:
//!
//! ```text
//! new_direct / new_copy
//!        |
//!        v
//!   Recording --close--> Closed --submit--> Recording
//!       ^                  |
//!       +------reset-------+
//! ```
//!
//! - [`close`](CommandList::close) finalizes the recorded commands.
//! - [`submit`](CommandList::submit) hands the closed list to a queue and immediately
//!   reopens it for the next recording pass. Previously recorded commands stay alive in
//!   the allocator.
//! - [`reset`](CommandList::reset) reclaims the allocator's memory and reopens the list.
//!
//! ## Allocator reuse
//!
//! Resetting an allocator while the GPU still executes commands recorded from it is
//! undefined behavior at the driver level. The command list has no way to know when the
//! GPU is done, so calling [`reset`](CommandList::reset) only after the last submission
//! completed is the caller's responsibility. [`CommandListPool`](crate::pool::CommandListPool)
//! takes care of this with a [`Timeline`](crate::sync::Timeline).
//!
//! ## Failures
//!
//! Native failures at this layer mean invalid usage or a lost device. The lifecycle
//! operations treat them as fatal and panic after logging the error. Every operation has a
//! `try_` counterpart returning [`CommandListError`] for callers that handle device loss.
//!
//! ## Example
//!
//! ```
//! use scoria::backend::mock::{Mock, MockDevice};
//! use scoria::{ash::vk, command::{CommandList, CommandListState}};
//!
//! let device = MockDevice::new();
//! let mut queue = device.create_queue(vk::QueueFlags::TRANSFER);
//!
//! let mut upload = CommandList::<Mock>::new_copy(&device);
//! upload.record(|_list| {
//!     // Record copy commands here
//! });
//! upload.close();
//! upload.submit(&mut queue);
//! assert_eq!(upload.state(), CommandListState::Recording);
//! ```

use crate::{
    backend::{Backend, RawAllocator, RawCommandList, RawDevice, RawQueue},
    engine::EngineType,
    error::{CommandListError, NativeOp, NativeResultExt, Result, fatal},
};

/// Represents the current state of a command list in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListState {
    /// Open for recording. Initial state, and the state after submission or reset.
    Recording,

    /// Recording finished, ready for submission to a queue.
    Closed,

    /// Handed to a queue, but reopening it for recording failed. The GPU may still be
    /// executing it. Only [`reset`](CommandList::reset) leaves this state.
    Pending,
}

/// A native command allocator and command list, paired for their whole lifetime.
///
/// # Thread Safety
///
/// Every mutating operation takes `&mut self`, so a command list is recorded from one
/// thread at a time. It may be moved between threads if the backend objects allow it.
pub struct CommandList<B: Backend> {
    // Declared before the allocator so the list is destroyed first.
    list: B::CommandList,
    allocator: B::Allocator,
    engine: EngineType,
    state: CommandListState,
    submissions: u64,
}

impl<B: Backend> CommandList<B> {
    /// Creates a command list for general graphics and compute work.
    ///
    /// # Panics
    ///
    /// Panics if the device fails to create the allocator or the list.
    #[track_caller]
    pub fn new_direct(device: &B::Device) -> Self {
        match Self::try_new(device, EngineType::Direct) {
            Ok(list) => list,
            Err(err) => fatal(err),
        }
    }

    /// Creates a command list for transfer-only work.
    ///
    /// The allocator is requested with the general kind; only the list type differs.
    ///
    /// # Panics
    ///
    /// Panics if the device fails to create the allocator or the list.
    #[track_caller]
    pub fn new_copy(device: &B::Device) -> Self {
        match Self::try_new(device, EngineType::Copy) {
            Ok(list) => list,
            Err(err) => fatal(err),
        }
    }

    /// Allocates a command allocator and a command list of the given engine type.
    pub fn try_new(device: &B::Device, engine: EngineType) -> Result<Self> {
        let mut allocator = device
            .create_command_allocator(engine.allocator_kind())
            .native(NativeOp::CreateAllocator)?;
        let list = device
            .create_command_list(engine, &mut allocator)
            .native(NativeOp::CreateCommandList)?;
        tracing::debug!(%engine, "created command list");
        Ok(Self {
            list,
            allocator,
            engine,
            state: CommandListState::Recording,
            submissions: 0,
        })
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    /// Number of times this list was handed to a queue.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// The native command list.
    pub fn raw(&self) -> &B::CommandList {
        &self.list
    }

    /// The native command allocator backing this list.
    pub fn raw_allocator(&self) -> &B::Allocator {
        &self.allocator
    }

    fn expect_state(&self, op: &'static str, expected: CommandListState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CommandListError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Record commands into the native command list.
    ///
    /// # Panics
    ///
    /// Panics if the list is closed or the native list fails to open.
    #[track_caller]
    pub fn record<T>(&mut self, callback: impl FnOnce(&mut B::CommandList) -> T) -> T {
        match self.try_record(callback) {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }

    pub fn try_record<T>(
        &mut self,
        callback: impl FnOnce(&mut B::CommandList) -> T,
    ) -> Result<T> {
        self.expect_state("record", CommandListState::Recording)?;
        self.list.open().native(NativeOp::Open)?;
        Ok(callback(&mut self.list))
    }

    /// Finalizes the recorded commands. Must be called before [`submit`](Self::submit).
    ///
    /// # Panics
    ///
    /// Panics if the list is already closed or the native close fails.
    #[track_caller]
    pub fn close(&mut self) {
        if let Err(err) = self.try_close() {
            fatal(err);
        }
    }

    pub fn try_close(&mut self) -> Result<()> {
        self.expect_state("close", CommandListState::Recording)?;
        self.list.close().native(NativeOp::Close)?;
        self.state = CommandListState::Closed;
        tracing::trace!(engine = %self.engine, "closed command list");
        Ok(())
    }

    /// Schedules the closed list on `queue` and reopens it for recording.
    ///
    /// Returns as soon as the queue accepted the work. The allocator is not reset: the
    /// commands just submitted live in it until [`reset`](Self::reset) is called after the
    /// GPU finished them.
    ///
    /// If the queue accepted the list but reopening it failed, the list is left
    /// [`Pending`](CommandListState::Pending) and must not be submitted again before
    /// [`reset`](Self::reset).
    ///
    /// # Panics
    ///
    /// Panics if the list was not closed, the queue cannot run this engine type, or a
    /// native call fails.
    #[track_caller]
    pub fn submit(&mut self, queue: &mut B::Queue) {
        if let Err(err) = self.try_submit(queue) {
            fatal(err);
        }
    }

    pub fn try_submit(&mut self, queue: &mut B::Queue) -> Result<()> {
        self.expect_state("submit", CommandListState::Closed)?;
        if !queue.supports(&self.list, self.engine) {
            return Err(CommandListError::EngineMismatch {
                engine: self.engine,
                caps: queue.capabilities(),
            });
        }
        queue.execute(&[&self.list]).native(NativeOp::Execute)?;
        self.submissions += 1;
        self.state = CommandListState::Pending;
        self.list
            .reset(&self.allocator)
            .native(NativeOp::ResetCommandList)?;
        self.state = CommandListState::Recording;
        tracing::trace!(
            engine = %self.engine,
            submissions = self.submissions,
            "submitted command list"
        );
        Ok(())
    }

    /// Reclaims the allocator's memory and reopens the list.
    ///
    /// Valid in every state. An open list is closed first, discarding anything recorded.
    ///
    /// The GPU must have finished every submission made from this list.
    ///
    /// # Panics
    ///
    /// Panics if a native call fails.
    #[track_caller]
    pub fn reset(&mut self) {
        if let Err(err) = self.try_reset() {
            fatal(err);
        }
    }

    pub fn try_reset(&mut self) -> Result<()> {
        if self.state == CommandListState::Recording {
            self.list.close().native(NativeOp::Close)?;
            self.state = CommandListState::Closed;
        }
        // Pending lists were closed natively before they were executed.
        self.allocator.reset().native(NativeOp::ResetAllocator)?;
        self.list
            .reset(&self.allocator)
            .native(NativeOp::ResetCommandList)?;
        self.state = CommandListState::Recording;
        tracing::trace!(engine = %self.engine, "reset command list");
        Ok(())
    }
}

impl<B: Backend> std::fmt::Debug for CommandList<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("engine", &self.engine)
            .field("state", &self.state)
            .field("submissions", &self.submissions)
            .finish()
    }
}

impl<B: Backend> Drop for CommandList<B> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        match self.state {
            CommandListState::Closed => tracing::warn!(
                engine = %self.engine,
                "Dropping a closed CommandList without submitting it"
            ),
            CommandListState::Pending => tracing::warn!(
                engine = %self.engine,
                "Dropping a pending CommandList that the GPU may still execute"
            ),
            CommandListState::Recording => {}
        }
    }
}
