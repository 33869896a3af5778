//! In-memory backend.
//!
//! [`Mock`] simulates the native layer closely enough to exercise the command list
//! lifecycle without a GPU:
//!
//! - Every object gets a unique [`ObjectId`] and every native call is appended to an
//!   event log ([`MockDevice::events`]).
//! - Command lists carry a native open/closed state. Closing twice, executing an open
//!   list or resetting an open list are reported as `ERROR_VALIDATION_FAILED_EXT`.
//! - Failures can be injected per native call with [`MockDevice::fail_next`].
//! - The simulated GPU only makes progress when told to ([`MockDevice::advance`],
//!   [`MockDevice::complete_all`]) or when the host waits on a fence. Allocator resets that
//!   happen while work recorded from the allocator is still in flight are counted as
//!   [`hazards`](MockDevice::hazards).
//!
//! ```
//! use scoria::backend::mock::{Mock, MockDevice};
//! use scoria::{ash::vk, command::CommandList};
//!
//! let device = MockDevice::new();
//! let mut queue = device.create_queue(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
//! let mut list = CommandList::<Mock>::new_direct(&device);
//! list.close();
//! list.submit(&mut queue);
//! assert_eq!(device.executed().len(), 1);
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use ash::{prelude::VkResult, vk};

use super::{Backend, RawAllocator, RawCommandList, RawDevice, RawFence, RawQueue};
use crate::{engine::EngineType, error::NativeOp};

/// Marker type selecting the in-memory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mock {}

impl Backend for Mock {
    type Device = MockDevice;
    type Allocator = MockAllocator;
    type CommandList = MockCommandList;
    type Queue = MockQueue;
    type Fence = MockFence;
}

/// Identity of a simulated native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

/// A native call observed by the simulated driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    CreateAllocator {
        allocator: ObjectId,
        kind: EngineType,
    },
    CreateCommandList {
        list: ObjectId,
        engine: EngineType,
        allocator: ObjectId,
    },
    Close {
        list: ObjectId,
    },
    ResetCommandList {
        list: ObjectId,
    },
    ResetAllocator {
        allocator: ObjectId,
    },
    Execute {
        list: ObjectId,
        caps: vk::QueueFlags,
    },
    Signal {
        fence: ObjectId,
        value: u64,
    },
    DestroyAllocator {
        allocator: ObjectId,
    },
    DestroyCommandList {
        list: ObjectId,
    },
}

/// A command list handed to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedList {
    pub list: ObjectId,
    pub allocator: ObjectId,
    pub engine: EngineType,
    pub caps: vk::QueueFlags,
}

struct ListRecord {
    allocator: ObjectId,
    open: bool,
}

struct SignalPoint {
    fence: ObjectId,
    value: u64,
    /// Number of executions that precede this signal.
    executions: u64,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    faults: Vec<(NativeOp, vk::Result)>,
    events: Vec<MockEvent>,
    executed: Vec<ExecutedList>,
    lists: HashMap<ObjectId, ListRecord>,
    fences: HashMap<ObjectId, u64>,
    /// Execution count at which each allocator was last used.
    allocator_last_use: HashMap<ObjectId, u64>,
    pending_signals: VecDeque<SignalPoint>,
    /// Executions the simulated GPU has finished.
    retired: u64,
    hazards: usize,
}

impl MockState {
    fn alloc_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }

    fn check(&mut self, op: NativeOp) -> VkResult<()> {
        match self.faults.iter().position(|(fault, _)| *fault == op) {
            Some(index) => Err(self.faults.remove(index).1),
            None => Ok(()),
        }
    }

    fn retire_next_signal(&mut self) -> bool {
        let Some(point) = self.pending_signals.pop_front() else {
            return false;
        };
        self.retired = self.retired.max(point.executions);
        let completed = self.fences.entry(point.fence).or_default();
        *completed = (*completed).max(point.value);
        true
    }
}

/// A simulated device. Cloning yields another handle to the same device.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("objects", &self.state().next_id)
            .finish()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // Objects are dropped during unwinding too, so a poisoned lock must stay usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a queue belonging to a family with the given capabilities.
    pub fn create_queue(&self, caps: vk::QueueFlags) -> MockQueue {
        MockQueue {
            device: self.clone(),
            caps,
            dedicated: None,
        }
    }

    /// Returns a queue whose family only accepts command lists recorded for `engine`.
    pub fn create_dedicated_queue(&self, caps: vk::QueueFlags, engine: EngineType) -> MockQueue {
        MockQueue {
            device: self.clone(),
            caps,
            dedicated: Some(engine),
        }
    }

    /// Makes the next `op` call fail with `result`.
    ///
    /// Faults queue up: injecting the same op twice fails the next two calls.
    pub fn fail_next(&self, op: NativeOp, result: vk::Result) {
        self.state().faults.push((op, result));
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Every command list executed so far, in execution order.
    pub fn executed(&self) -> Vec<ExecutedList> {
        self.state().executed.clone()
    }

    /// Returns whether the native list is open for recording, or `None` if it was destroyed.
    pub fn is_open(&self, list: ObjectId) -> Option<bool> {
        self.state().lists.get(&list).map(|record| record.open)
    }

    /// Lets the simulated GPU reach the next `signals` signal points.
    pub fn advance(&self, signals: usize) {
        let mut state = self.state();
        for _ in 0..signals {
            if !state.retire_next_signal() {
                break;
            }
        }
    }

    /// Lets the simulated GPU finish all submitted work.
    pub fn complete_all(&self) {
        let mut state = self.state();
        while state.retire_next_signal() {}
        state.retired = state.executed.len() as u64;
    }

    /// Number of allocator resets that happened while work recorded from the allocator was
    /// still in flight.
    pub fn hazards(&self) -> usize {
        self.state().hazards
    }
}

impl RawDevice<Mock> for MockDevice {
    fn create_command_allocator(&self, kind: EngineType) -> VkResult<MockAllocator> {
        let mut state = self.state();
        state.check(NativeOp::CreateAllocator)?;
        let id = state.alloc_id();
        state.events.push(MockEvent::CreateAllocator {
            allocator: id,
            kind,
        });
        Ok(MockAllocator {
            device: self.clone(),
            id,
            kind,
        })
    }

    fn create_command_list(
        &self,
        engine: EngineType,
        allocator: &mut MockAllocator,
    ) -> VkResult<MockCommandList> {
        let mut state = self.state();
        state.check(NativeOp::CreateCommandList)?;
        let id = state.alloc_id();
        state.lists.insert(
            id,
            ListRecord {
                allocator: allocator.id,
                open: true,
            },
        );
        state.events.push(MockEvent::CreateCommandList {
            list: id,
            engine,
            allocator: allocator.id,
        });
        Ok(MockCommandList {
            device: self.clone(),
            id,
            engine,
        })
    }

    fn create_fence(&self) -> VkResult<MockFence> {
        let mut state = self.state();
        state.check(NativeOp::CreateFence)?;
        let id = state.alloc_id();
        state.fences.insert(id, 0);
        Ok(MockFence {
            device: self.clone(),
            id,
        })
    }
}

pub struct MockAllocator {
    device: MockDevice,
    id: ObjectId,
    kind: EngineType,
}

impl MockAllocator {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The allocator kind requested at creation.
    pub fn kind(&self) -> EngineType {
        self.kind
    }
}

impl RawAllocator for MockAllocator {
    fn reset(&mut self) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::ResetAllocator)?;
        let recording = state
            .lists
            .values()
            .any(|record| record.allocator == self.id && record.open);
        if recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let last_use = state.allocator_last_use.get(&self.id).copied();
        if last_use.is_some_and(|last_use| last_use > state.retired) {
            state.hazards += 1;
        }
        state
            .events
            .push(MockEvent::ResetAllocator { allocator: self.id });
        Ok(())
    }
}

impl Drop for MockAllocator {
    fn drop(&mut self) {
        let mut state = self.device.state();
        state.allocator_last_use.remove(&self.id);
        state
            .events
            .push(MockEvent::DestroyAllocator { allocator: self.id });
    }
}

pub struct MockCommandList {
    device: MockDevice,
    id: ObjectId,
    engine: EngineType,
}

impl MockCommandList {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// The allocator this list is bound to.
    pub fn allocator(&self) -> ObjectId {
        self.device.state().lists[&self.id].allocator
    }
}

impl RawCommandList<Mock> for MockCommandList {
    fn open(&mut self) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::Open)?;
        if state.lists[&self.id].open {
            Ok(())
        } else {
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
        }
    }

    fn close(&mut self) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::Close)?;
        let record = state
            .lists
            .get_mut(&self.id)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !record.open {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        record.open = false;
        state.events.push(MockEvent::Close { list: self.id });
        Ok(())
    }

    fn reset(&mut self, allocator: &MockAllocator) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::ResetCommandList)?;
        let record = state
            .lists
            .get_mut(&self.id)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if record.open || record.allocator != allocator.id {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        record.open = true;
        state
            .events
            .push(MockEvent::ResetCommandList { list: self.id });
        Ok(())
    }
}

impl Drop for MockCommandList {
    fn drop(&mut self) {
        let mut state = self.device.state();
        state.lists.remove(&self.id);
        state
            .events
            .push(MockEvent::DestroyCommandList { list: self.id });
    }
}

pub struct MockQueue {
    device: MockDevice,
    caps: vk::QueueFlags,
    dedicated: Option<EngineType>,
}

impl RawQueue<Mock> for MockQueue {
    fn capabilities(&self) -> vk::QueueFlags {
        self.caps
    }

    fn supports(&self, list: &MockCommandList, engine: EngineType) -> bool {
        self.dedicated.is_none_or(|dedicated| dedicated == list.engine)
            && engine.is_supported_by(self.caps)
    }

    fn execute(&mut self, lists: &[&MockCommandList]) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::Execute)?;
        let mut batch = Vec::with_capacity(lists.len());
        for list in lists {
            let record = state.lists.get(&list.id).ok_or(vk::Result::ERROR_UNKNOWN)?;
            if record.open || self.dedicated.is_some_and(|engine| engine != list.engine) {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            batch.push(ExecutedList {
                list: list.id,
                allocator: record.allocator,
                engine: list.engine,
                caps: self.caps,
            });
        }
        for executed in batch {
            state.executed.push(executed);
            let executions = state.executed.len() as u64;
            state
                .allocator_last_use
                .insert(executed.allocator, executions);
            state.events.push(MockEvent::Execute {
                list: executed.list,
                caps: self.caps,
            });
        }
        Ok(())
    }

    fn signal(&mut self, fence: &MockFence, value: u64) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::Signal)?;
        let executions = state.executed.len() as u64;
        state.pending_signals.push_back(SignalPoint {
            fence: fence.id,
            value,
            executions,
        });
        state.events.push(MockEvent::Signal {
            fence: fence.id,
            value,
        });
        Ok(())
    }
}

pub struct MockFence {
    device: MockDevice,
    id: ObjectId,
}

impl MockFence {
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl RawFence for MockFence {
    fn completed_value(&self) -> VkResult<u64> {
        Ok(self.device.state().fences.get(&self.id).copied().unwrap_or(0))
    }

    /// Waiting lets the simulated GPU run until the fence reaches `value`.
    fn wait(&self, value: u64, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.device.state();
        state.check(NativeOp::Wait)?;
        loop {
            if state.fences.get(&self.id).copied().unwrap_or(0) >= value {
                return Ok(());
            }
            let reachable = state
                .pending_signals
                .iter()
                .any(|point| point.fence == self.id && point.value >= value);
            if !reachable || !state.retire_next_signal() {
                return Err(vk::Result::TIMEOUT);
            }
        }
    }
}
