//! Engine types.
//!
//! Every command list targets one GPU engine for its whole lifetime. The engine type
//! decides which native list-creation path is taken and which queues may execute the list.

use ash::vk;
use serde::{Deserialize, Serialize};

/// The category of GPU work a command list is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum EngineType {
    /// General engine work: graphics, compute and transfer commands.
    #[default]
    Direct,
    /// Transfer-only work: uploads and readbacks that may overlap with graphics work
    /// when submitted to a dedicated copy queue.
    Copy,
}

impl EngineType {
    /// The allocator kind requested when creating a list of this engine type.
    ///
    /// Allocators are engine-agnostic at the allocation level, so both engine types use
    /// the general kind. Only the list-creation step differs.
    pub const fn allocator_kind(self) -> EngineType {
        EngineType::Direct
    }

    /// Queue capabilities this engine type relies on.
    pub fn required_queue_flags(self) -> vk::QueueFlags {
        match self {
            EngineType::Direct => vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            EngineType::Copy => vk::QueueFlags::TRANSFER,
        }
    }

    /// Returns true if a queue with `caps` can execute lists of this engine type.
    ///
    /// Queues with graphics or compute capabilities implicitly support transfer
    /// operations even when they do not report `TRANSFER`. Backends may restrict this
    /// further per queue family, see [`RawQueue::supports`](crate::backend::RawQueue::supports).
    pub fn is_supported_by(self, caps: vk::QueueFlags) -> bool {
        match self {
            EngineType::Direct => caps.contains(self.required_queue_flags()),
            EngineType::Copy => caps.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineType::Direct => "direct",
            EngineType::Copy => "copy",
        }
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_kind_is_general_for_both_engines() {
        assert_eq!(EngineType::Direct.allocator_kind(), EngineType::Direct);
        assert_eq!(EngineType::Copy.allocator_kind(), EngineType::Direct);
    }

    #[test]
    fn queue_support() {
        let universal =
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        assert!(EngineType::Direct.is_supported_by(universal));
        assert!(EngineType::Copy.is_supported_by(universal));

        // Dedicated transfer family
        assert!(!EngineType::Direct.is_supported_by(vk::QueueFlags::TRANSFER));
        assert!(EngineType::Copy.is_supported_by(vk::QueueFlags::TRANSFER));

        // Async compute family without the TRANSFER bit still copies
        assert!(EngineType::Copy.is_supported_by(vk::QueueFlags::COMPUTE));
        assert!(!EngineType::Direct.is_supported_by(vk::QueueFlags::COMPUTE));

        assert!(!EngineType::Copy.is_supported_by(vk::QueueFlags::SPARSE_BINDING));
    }

    #[test]
    fn display_names() {
        assert_eq!(EngineType::Direct.to_string(), "direct");
        assert_eq!(EngineType::Copy.to_string(), "copy");
    }
}
