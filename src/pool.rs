//! Command list pooling.
//!
//! A [`CommandListPool`] hands out [`CommandList`]s of one engine type and takes them back
//! after submission. Submitted lists are parked together with the [`SubmissionTicket`] of
//! their submission, and their allocators are only reset once the GPU reached that ticket.
//! This is what makes allocator reuse safe.
//!
//! A pool submits to the one queue it owns. Tickets of a single timeline only order work
//! within one queue, so a pool never spreads its submissions across queues.
//!
//! ```
//! use scoria::backend::mock::{Mock, MockDevice};
//! use scoria::{ash::vk, pool::{CommandListPool, PoolConfig}};
//!
//! let device = MockDevice::new();
//! let queue = device.create_queue(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
//! let mut pool =
//!     CommandListPool::<Mock>::new(device.clone(), queue, PoolConfig::default()).unwrap();
//!
//! let mut list = pool.acquire().unwrap();
//! list.record(|_list| {
//!     // Record commands here
//! });
//! list.close();
//! let ticket = pool.submit(list).unwrap();
//! assert_eq!(pool.in_flight_count(), 1);
//! assert!(!pool.timeline().is_complete(ticket).unwrap());
//!
//! pool.wait_idle().unwrap();
//! assert_eq!(pool.in_flight_count(), 0);
//! assert_eq!(pool.free_count(), 1);
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    backend::{Backend, RawQueue},
    command::{CommandList, CommandListState},
    engine::EngineType,
    error::{CommandListError, NativeOp, NativeResultExt, Result},
    sync::{SubmissionTicket, Timeline},
};

/// Configuration for a [`CommandListPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Engine type of the command lists handed out.
    pub engine: EngineType,

    /// Maximum number of reset command lists kept for reuse. Extra lists are destroyed.
    pub max_free: usize,

    /// Number of command lists created up front.
    pub preallocate: usize,

    /// Timeout for [`CommandListPool::wait_idle`], in nanoseconds.
    pub wait_timeout_ns: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            engine: EngineType::Direct,
            max_free: 8,
            preallocate: 0,
            wait_timeout_ns: u64::MAX,
        }
    }
}

impl PoolConfig {
    pub fn copy() -> Self {
        Self {
            engine: EngineType::Copy,
            ..Default::default()
        }
    }
}

/// A pool of command lists that reclaims allocators once the GPU is done with them.
///
/// # Thread Safety
///
/// Like command lists themselves, pools are used from one thread at a time.
///
/// # Drop
///
/// Dropping the pool blocks until every submission made through it completed. If that
/// wait fails, the lists still in flight are leaked.
pub struct CommandListPool<B: Backend> {
    device: B::Device,
    queue: B::Queue,
    config: PoolConfig,
    timeline: Timeline<B>,

    /// Reset lists ready to be handed out.
    free: Vec<CommandList<B>>,

    /// Submitted lists in submission order, with the ticket signaled right after them.
    in_flight: VecDeque<(SubmissionTicket, CommandList<B>)>,
}

impl<B: Backend> CommandListPool<B> {
    /// Creates a pool submitting to `queue`.
    pub fn new(device: B::Device, queue: B::Queue, config: PoolConfig) -> Result<Self> {
        let caps = queue.capabilities();
        if !config.engine.is_supported_by(caps) {
            return Err(CommandListError::EngineMismatch {
                engine: config.engine,
                caps,
            });
        }
        let timeline = Timeline::new(&device).native(NativeOp::CreateFence)?;
        let mut free = Vec::with_capacity(config.preallocate);
        for _ in 0..config.preallocate {
            free.push(CommandList::try_new(&device, config.engine)?);
        }
        tracing::info!(
            engine = %config.engine,
            preallocated = config.preallocate,
            "created command list pool"
        );
        Ok(Self {
            device,
            queue,
            config,
            timeline,
            free,
            in_flight: VecDeque::new(),
        })
    }

    pub fn engine(&self) -> EngineType {
        self.config.engine
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    /// The queue submissions go to. Work submitted directly through it is ordered before
    /// the next ticket the pool signals.
    pub fn queue_mut(&mut self) -> &mut B::Queue {
        &mut self.queue
    }

    pub fn timeline(&self) -> &Timeline<B> {
        &self.timeline
    }

    /// Number of reset lists ready to be handed out.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of submitted lists the GPU may still be executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Hands out a command list in the recording state.
    ///
    /// Completed submissions are reclaimed first. A new list is created if none is free.
    pub fn acquire(&mut self) -> Result<CommandList<B>> {
        self.reclaim()?;
        match self.free.pop() {
            Some(list) => Ok(list),
            None => CommandList::try_new(&self.device, self.config.engine),
        }
    }

    /// Submits a closed command list and keeps it until the GPU finished executing it.
    ///
    /// If the queue rejected the list, it is dropped. If the queue accepted it but a later
    /// step failed, it stays tracked until completion and the error is returned.
    pub fn submit(&mut self, mut list: CommandList<B>) -> Result<SubmissionTicket> {
        debug_assert_eq!(list.engine(), self.config.engine);
        if let Err(err) = list.try_submit(&mut self.queue) {
            if list.state() == CommandListState::Pending {
                tracing::error!(error = %err, "submitted command list could not be reopened");
                self.track(list)?;
            }
            return Err(err);
        }
        self.track(list)
    }

    /// Parks a list the queue accepted behind a new ticket.
    fn track(&mut self, list: CommandList<B>) -> Result<SubmissionTicket> {
        match self.timeline.signal(&mut self.queue) {
            Ok(ticket) => {
                self.in_flight.push_back((ticket, list));
                Ok(ticket)
            }
            Err(result) => {
                // Nothing will tell when the GPU is done with this list.
                tracing::error!(?result, "failed to signal submission timeline");
                std::mem::forget(list);
                Err(CommandListError::Native {
                    op: NativeOp::Signal,
                    result,
                })
            }
        }
    }

    /// Returns a command list that was never submitted, or whose submissions are known to
    /// be complete.
    pub fn release(&mut self, mut list: CommandList<B>) -> Result<()> {
        debug_assert_eq!(list.engine(), self.config.engine);
        list.try_reset()?;
        self.keep(list);
        Ok(())
    }

    /// Resets and frees every submitted list whose ticket was reached.
    ///
    /// Returns the number of lists reclaimed.
    pub fn reclaim(&mut self) -> Result<usize> {
        if self.in_flight.is_empty() {
            return Ok(0);
        }
        let completed = self.timeline.completed().native(NativeOp::Wait)?;
        let mut reclaimed = 0;
        while self
            .in_flight
            .front()
            .is_some_and(|(ticket, _)| *ticket <= completed)
        {
            let Some((_, mut list)) = self.in_flight.pop_front() else {
                break;
            };
            list.try_reset()?;
            self.keep(list);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            tracing::trace!(reclaimed, completed = completed.value(), "reclaimed command lists");
        }
        Ok(reclaimed)
    }

    /// Blocks until every submission made through this pool completed, then reclaims.
    pub fn wait_idle(&mut self) -> Result<()> {
        if let Some((ticket, _)) = self.in_flight.back() {
            self.timeline
                .wait(*ticket, self.config.wait_timeout_ns)
                .native(NativeOp::Wait)?;
        }
        self.reclaim()?;
        Ok(())
    }

    fn keep(&mut self, list: CommandList<B>) {
        debug_assert_eq!(list.state(), CommandListState::Recording);
        if self.free.len() < self.config.max_free {
            self.free.push(list);
        } else {
            tracing::trace!(max_free = self.config.max_free, "dropping surplus command list");
        }
    }
}

impl<B: Backend> Drop for CommandListPool<B> {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        tracing::warn!(
            in_flight = self.in_flight.len(),
            "Dropping CommandListPool while command lists are still in flight"
        );
        if let Err(err) = self.wait_idle() {
            tracing::error!(
                error = %err,
                leaked = self.in_flight.len(),
                "failed to wait for command lists in flight, leaking them"
            );
            for (_, list) in self.in_flight.drain(..) {
                std::mem::forget(list);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::backend::mock::{Mock, MockDevice, MockEvent};

    fn setup(config: PoolConfig) -> (MockDevice, CommandListPool<Mock>) {
        crate::init_test_tracing();
        let device = MockDevice::new();
        let queue = device.create_queue(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        );
        let pool = CommandListPool::new(device.clone(), queue, config).unwrap();
        (device, pool)
    }

    fn submit_one(pool: &mut CommandListPool<Mock>) -> SubmissionTicket {
        let mut list = pool.acquire().unwrap();
        list.close();
        pool.submit(list).unwrap()
    }

    fn position(events: &[MockEvent], predicate: impl Fn(&MockEvent) -> bool) -> usize {
        events.iter().position(predicate).unwrap()
    }

    #[test]
    fn allocators_are_reset_only_after_completion() {
        let (device, mut pool) = setup(PoolConfig::default());
        let first = submit_one(&mut pool);
        let second = submit_one(&mut pool);
        assert!(first < second);
        assert_eq!(pool.in_flight_count(), 2);

        // Nothing completed yet: nothing may be reclaimed.
        assert_eq!(pool.reclaim().unwrap(), 0);
        assert!(
            !device
                .events()
                .iter()
                .any(|event| matches!(event, MockEvent::ResetAllocator { .. }))
        );

        device.advance(1);
        assert_eq!(pool.reclaim().unwrap(), 1);
        assert_eq!(pool.in_flight_count(), 1);
        assert_eq!(pool.free_count(), 1);

        pool.wait_idle().unwrap();
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(device.hazards(), 0);
    }

    #[test]
    fn acquire_reuses_reclaimed_lists() {
        let (device, mut pool) = setup(PoolConfig::default());
        let mut list = pool.acquire().unwrap();
        let id = list.raw().id();
        list.close();
        pool.submit(list).unwrap();

        // Still in flight: a second list is created.
        let other = pool.acquire().unwrap();
        assert_ne!(other.raw().id(), id);
        pool.release(other).unwrap();

        device.complete_all();
        let mut reused = Vec::new();
        while pool.free_count() > 0 || pool.in_flight_count() > 0 {
            reused.push(pool.acquire().unwrap().raw().id());
        }
        assert!(reused.contains(&id));
        assert_eq!(device.hazards(), 0);
    }

    #[test]
    fn preallocated_lists_match_the_engine() {
        let (_device, mut pool) = setup(PoolConfig {
            preallocate: 3,
            ..PoolConfig::copy()
        });
        assert_eq!(pool.engine(), EngineType::Copy);
        assert_eq!(pool.free_count(), 3);
        let list = pool.acquire().unwrap();
        assert_eq!(list.engine(), EngineType::Copy);
        assert_eq!(list.raw_allocator().kind(), EngineType::Direct);
        assert_eq!(pool.free_count(), 2);
        pool.release(list).unwrap();
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn every_ticket_is_signaled_on_the_owned_queue() {
        let (device, mut pool) = setup(PoolConfig::copy());
        let caps = pool.queue().capabilities();
        let tickets = [submit_one(&mut pool), submit_one(&mut pool)];
        assert!(tickets[0] < tickets[1]);
        assert!(device.executed().iter().all(|executed| executed.caps == caps));

        let fence = pool.timeline().raw_fence().id();
        let signals: Vec<u64> = device
            .events()
            .iter()
            .filter_map(|event| match event {
                MockEvent::Signal { fence: signaled, value } if *signaled == fence => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![1, 2]);
    }

    #[test]
    fn queue_must_support_the_engine() {
        let device = MockDevice::new();
        let queue = device.create_queue(vk::QueueFlags::TRANSFER);
        assert!(matches!(
            CommandListPool::<Mock>::new(device.clone(), queue, PoolConfig::default()),
            Err(CommandListError::EngineMismatch {
                engine: EngineType::Direct,
                ..
            })
        ));
    }

    #[test]
    fn surplus_lists_are_destroyed() {
        let (device, mut pool) = setup(PoolConfig {
            max_free: 1,
            ..Default::default()
        });
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let b_id = b.raw().id();
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(device.is_open(b_id), None);
    }

    #[test]
    fn released_closed_list_is_reset() {
        let (_device, mut pool) = setup(PoolConfig::default());
        let mut list = pool.acquire().unwrap();
        list.close();
        pool.release(list).unwrap();
        let list = pool.acquire().unwrap();
        assert_eq!(list.state(), CommandListState::Recording);
        assert_eq!(list.submissions(), 0);
    }

    #[test]
    fn submit_errors_are_returned() {
        let (device, mut pool) = setup(PoolConfig::default());
        let list = pool.acquire().unwrap();
        assert!(matches!(
            pool.submit(list),
            Err(CommandListError::InvalidState { op: "submit", .. })
        ));

        let mut list = pool.acquire().unwrap();
        list.close();
        device.fail_next(NativeOp::Signal, vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(
            pool.submit(list),
            Err(CommandListError::Native {
                op: NativeOp::Signal,
                result: vk::Result::ERROR_DEVICE_LOST,
            })
        );
        assert_eq!(pool.in_flight_count(), 0);
    }

    #[test]
    fn executed_list_stays_tracked_when_reopening_fails() {
        let (device, mut pool) = setup(PoolConfig::default());
        let mut list = pool.acquire().unwrap();
        let id = list.raw().id();
        let allocator = list.raw().allocator();
        list.close();
        device.clear_events();
        device.fail_next(NativeOp::ResetCommandList, vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(
            pool.submit(list),
            Err(CommandListError::Native {
                op: NativeOp::ResetCommandList,
                result: vk::Result::ERROR_DEVICE_LOST,
            })
        );
        assert_eq!(pool.in_flight_count(), 1);
        assert_eq!(device.is_open(id), Some(false));
        assert!(
            !device
                .events()
                .iter()
                .any(|event| *event == MockEvent::DestroyAllocator { allocator })
        );

        pool.wait_idle().unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(device.is_open(id), Some(true));
        assert_eq!(device.hazards(), 0);
    }

    #[test]
    fn wait_idle_reports_timeout() {
        let (device, mut pool) = setup(PoolConfig {
            wait_timeout_ns: 0,
            ..Default::default()
        });
        submit_one(&mut pool);
        device.fail_next(NativeOp::Wait, vk::Result::TIMEOUT);
        assert_eq!(
            pool.wait_idle(),
            Err(CommandListError::Native {
                op: NativeOp::Wait,
                result: vk::Result::TIMEOUT,
            })
        );
        assert_eq!(pool.in_flight_count(), 1);
        pool.wait_idle().unwrap();
    }

    #[test]
    fn drop_waits_for_lists_in_flight() {
        let (device, mut pool) = setup(PoolConfig::default());
        let mut list = pool.acquire().unwrap();
        let allocator = list.raw().allocator();
        list.close();
        pool.submit(list).unwrap();
        device.clear_events();

        drop(pool);
        let events = device.events();
        let reset = position(&events, |event| {
            *event == MockEvent::ResetAllocator { allocator }
        });
        let destroyed = position(&events, |event| {
            *event == MockEvent::DestroyAllocator { allocator }
        });
        assert!(reset < destroyed);
        assert_eq!(device.hazards(), 0);
    }

    #[test]
    fn drop_leaks_lists_it_cannot_wait_for() {
        let (device, mut pool) = setup(PoolConfig::default());
        let mut list = pool.acquire().unwrap();
        let id = list.raw().id();
        list.close();
        pool.submit(list).unwrap();
        device.clear_events();

        device.fail_next(NativeOp::Wait, vk::Result::ERROR_DEVICE_LOST);
        drop(pool);
        assert!(!device.events().iter().any(|event| matches!(
            event,
            MockEvent::DestroyCommandList { .. } | MockEvent::DestroyAllocator { .. }
        )));
        assert_eq!(device.is_open(id), Some(false));
        assert_eq!(device.hazards(), 0);
    }

    #[test]
    fn config_from_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{ "engine": "Copy", "max_free": 2 }"#).unwrap();
        assert_eq!(
            config,
            PoolConfig {
                engine: EngineType::Copy,
                max_free: 2,
                ..Default::default()
            }
        );
        let json = serde_json::to_string(&PoolConfig::default()).unwrap();
        assert_eq!(
            serde_json::from_str::<PoolConfig>(&json).unwrap(),
            PoolConfig::default()
        );
    }
}
