//! In-flight tracking.
//!
//! Submitting a command list returns before the GPU executes it. Before the command
//! allocator behind that list may be reset, the host must know that execution finished.
//! A [`Timeline`] pairs a native fence with a monotonically increasing counter: every
//! [`signal`](Timeline::signal) asks the queue to set the fence to the next value once all
//! work submitted so far has completed, and hands back a [`SubmissionTicket`] that can be
//! polled or waited on.
//!
//! A timeline orders the work of one queue. Signal it from a single queue: a ticket
//! signaled on another queue may complete before earlier tickets do.
//!
//! ```
//! use scoria::backend::mock::{Mock, MockDevice};
//! use scoria::{ash::vk, command::CommandList, sync::Timeline};
//!
//! let device = MockDevice::new();
//! let mut queue = device.create_queue(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
//! let mut timeline = Timeline::<Mock>::new(&device).unwrap();
//!
//! let mut list = CommandList::<Mock>::new_direct(&device);
//! list.close();
//! list.submit(&mut queue);
//! let ticket = timeline.signal(&mut queue).unwrap();
//!
//! timeline.wait(ticket, !0).unwrap();
//! // The GPU is done with everything recorded so far.
//! list.reset();
//! ```

use ash::prelude::VkResult;

use crate::backend::{Backend, RawDevice, RawFence, RawQueue};

/// A point on a [`Timeline`]. Reached once all work submitted before it has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubmissionTicket(pub u64);

impl SubmissionTicket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// A fence counter for tracking GPU progress across submissions.
pub struct Timeline<B: Backend> {
    fence: B::Fence,

    /// Value of the most recent signal. The next signal uses `value + 1`.
    value: u64,
}

impl<B: Backend> Timeline<B> {
    pub fn new(device: &B::Device) -> VkResult<Self> {
        Ok(Self {
            fence: device.create_fence()?,
            value: 0,
        })
    }

    /// Signals the next point of the timeline on `queue`.
    ///
    /// The returned ticket completes once everything submitted to `queue` before this call
    /// has finished executing.
    pub fn signal(&mut self, queue: &mut B::Queue) -> VkResult<SubmissionTicket> {
        let value = self.value + 1;
        queue.signal(&self.fence, value)?;
        self.value = value;
        Ok(SubmissionTicket(value))
    }

    /// The most recently signaled ticket, completed or not.
    pub fn last_signaled(&self) -> SubmissionTicket {
        SubmissionTicket(self.value)
    }

    /// The most recent ticket the GPU has reached.
    pub fn completed(&self) -> VkResult<SubmissionTicket> {
        self.fence.completed_value().map(SubmissionTicket)
    }

    pub fn is_complete(&self, ticket: SubmissionTicket) -> VkResult<bool> {
        Ok(self.completed()? >= ticket)
    }

    /// Blocks until `ticket` is reached or `timeout_ns` elapsed.
    pub fn wait(&self, ticket: SubmissionTicket, timeout_ns: u64) -> VkResult<()> {
        if self.is_complete(ticket)? {
            return Ok(());
        }
        self.fence.wait(ticket.0, timeout_ns)
    }

    pub fn raw_fence(&self) -> &B::Fence {
        &self.fence
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::{
        backend::mock::{Mock, MockDevice},
        error::NativeOp,
    };

    #[test]
    fn tickets_increase() {
        let device = MockDevice::new();
        let mut queue = device.create_queue(vk::QueueFlags::TRANSFER);
        let mut timeline = Timeline::<Mock>::new(&device).unwrap();
        assert_eq!(timeline.last_signaled(), SubmissionTicket(0));
        assert!(timeline.is_complete(SubmissionTicket(0)).unwrap());

        let first = timeline.signal(&mut queue).unwrap();
        let second = timeline.signal(&mut queue).unwrap();
        assert!(first < second);
        assert_eq!(timeline.last_signaled(), second);
        assert!(!timeline.is_complete(first).unwrap());

        device.advance(1);
        assert!(timeline.is_complete(first).unwrap());
        assert!(!timeline.is_complete(second).unwrap());
        assert_eq!(timeline.completed().unwrap(), first);

        timeline.wait(second, !0).unwrap();
        assert!(timeline.is_complete(second).unwrap());
    }

    #[test]
    fn failed_signal_does_not_advance() {
        let device = MockDevice::new();
        let mut queue = device.create_queue(vk::QueueFlags::TRANSFER);
        let mut timeline = Timeline::<Mock>::new(&device).unwrap();
        device.fail_next(NativeOp::Signal, vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(
            timeline.signal(&mut queue),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
        assert_eq!(timeline.last_signaled(), SubmissionTicket(0));
        assert_eq!(timeline.signal(&mut queue), Ok(SubmissionTicket(1)));
    }

    #[test]
    fn waiting_past_the_last_signal_times_out() {
        let device = MockDevice::new();
        let timeline = Timeline::<Mock>::new(&device).unwrap();
        assert_eq!(
            timeline.wait(SubmissionTicket(1), 0),
            Err(vk::Result::TIMEOUT)
        );
    }
}
