//! Error reporting for command list operations.
//!
//! Every native call reports a [`vk::Result`]. Failures are surfaced as
//! [`CommandListError`] by the `try_` operations, and escalated to a panic by the
//! lifecycle operations through [`fatal`].

use ash::vk;

use crate::{command::CommandListState, engine::EngineType};

/// The native call that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    CreateAllocator,
    CreateCommandList,
    Open,
    Close,
    ResetCommandList,
    ResetAllocator,
    Execute,
    CreateFence,
    Signal,
    Wait,
}

impl NativeOp {
    pub fn name(self) -> &'static str {
        match self {
            NativeOp::CreateAllocator => "create command allocator",
            NativeOp::CreateCommandList => "create command list",
            NativeOp::Open => "open command list",
            NativeOp::Close => "close command list",
            NativeOp::ResetCommandList => "reset command list",
            NativeOp::ResetAllocator => "reset command allocator",
            NativeOp::Execute => "execute command list",
            NativeOp::CreateFence => "create fence",
            NativeOp::Signal => "signal fence",
            NativeOp::Wait => "wait for fence",
        }
    }
}

impl std::fmt::Display for NativeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandListError {
    #[error("native call failed: {op} returned {result:?}")]
    Native { op: NativeOp, result: vk::Result },

    #[error("cannot {op} a command list in the {state:?} state")]
    InvalidState {
        op: &'static str,
        state: CommandListState,
    },

    #[error("{engine} command list cannot run on a queue with capabilities {caps:?}")]
    EngineMismatch {
        engine: EngineType,
        caps: vk::QueueFlags,
    },
}

impl CommandListError {
    /// Returns the native result code if this error came from a native call.
    pub fn native_result(&self) -> Option<vk::Result> {
        match self {
            CommandListError::Native { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// Returns true if the device was lost. Device loss is the one condition that higher
    /// layers are expected to recover from by recreating the device.
    pub fn is_device_lost(&self) -> bool {
        self.native_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

pub type Result<T, E = CommandListError> = std::result::Result<T, E>;

/// Attaches the failing native call to a [`VkResult`](ash::prelude::VkResult).
pub(crate) trait NativeResultExt<T> {
    fn native(self, op: NativeOp) -> Result<T>;
}

impl<T> NativeResultExt<T> for ash::prelude::VkResult<T> {
    fn native(self, op: NativeOp) -> Result<T> {
        self.map_err(|result| CommandListError::Native { op, result })
    }
}

/// Escalates an error to a process-level failure.
///
/// Failures at this layer mean invalid usage or device loss. Neither has a meaningful
/// local recovery.
#[cold]
#[track_caller]
pub fn fatal(err: CommandListError) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, error = %err, "fatal command list failure");
    panic!("fatal command list failure: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_message_names_the_call() {
        let err = Err::<(), _>(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            .native(NativeOp::CreateAllocator)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "native call failed: create command allocator returned ERROR_OUT_OF_DEVICE_MEMORY"
        );
        assert_eq!(
            err.native_result(),
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert!(!err.is_device_lost());
    }

    #[test]
    fn device_loss_is_detected() {
        let err = CommandListError::Native {
            op: NativeOp::Execute,
            result: vk::Result::ERROR_DEVICE_LOST,
        };
        assert!(err.is_device_lost());
        let err = CommandListError::InvalidState {
            op: "submit",
            state: CommandListState::Recording,
        };
        assert!(!err.is_device_lost());
        assert_eq!(err.native_result(), None);
    }

    #[test]
    #[should_panic(expected = "fatal command list failure")]
    fn fatal_panics() {
        fatal(CommandListError::Native {
            op: NativeOp::Close,
            result: vk::Result::ERROR_UNKNOWN,
        });
    }
}
