//! Vulkan backend.
//!
//! | Lifecycle object | Vulkan object                                  |
//! |------------------|------------------------------------------------|
//! | allocator        | `VkCommandPool` with `RESET_COMMAND_BUFFER`    |
//! | command list     | primary `VkCommandBuffer`                      |
//! | queue            | `VkQueue`, submitted with `vkQueueSubmit2`     |
//! | fence            | timeline `VkSemaphore`                         |
//!
//! The device must have Vulkan 1.3 (or `synchronization2`) and timeline semaphores enabled.
//!
//! Vulkan does not allow re-recording a command buffer that is still pending. A list that was
//! handed to a queue is therefore only marked for reuse by [`RawCommandList::reset`]; the
//! buffer is begun again lazily on the next [`open`](RawCommandList::open) or
//! [`close`](RawCommandList::close). Recording into a submitted list must wait until its
//! submission completed, which [`CommandListPool`](crate::pool::CommandListPool) guarantees.
//!
//! A command buffer only runs on queues of the family its pool was created for. Copy lists
//! must therefore be submitted to a queue of the copy family passed to
//! [`VulkanDevice::from_raw`], even though graphics queues support transfers too.
use std::sync::atomic::{AtomicU64, Ordering};

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use super::{Backend, RawAllocator, RawCommandList, RawDevice, RawFence, RawQueue};
use crate::{engine::EngineType, utils::AsVkHandle};

/// Marker type selecting the Vulkan backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vulkan {}

impl Backend for Vulkan {
    type Device = VulkanDevice;
    type Allocator = VulkanAllocator;
    type CommandList = VulkanCommandList;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
}

/// A logical device along with the queue families each engine type records for.
#[derive(Clone)]
pub struct VulkanDevice {
    device: ash::Device,
    direct_family: u32,
    copy_family: u32,
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("handle", &self.device.handle())
            .field("direct_family", &self.direct_family)
            .field("copy_family", &self.copy_family)
            .finish()
    }
}

impl VulkanDevice {
    /// # Safety
    /// - `device` must be a valid logical device that outlives every object created through
    ///   the returned value.
    /// - Timeline semaphores and `synchronization2` must be enabled on `device`.
    /// - `direct_family` must support graphics and compute. `copy_family` must support
    ///   transfer operations.
    pub unsafe fn from_raw(device: ash::Device, direct_family: u32, copy_family: u32) -> Self {
        Self {
            device,
            direct_family,
            copy_family,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// The queue family command lists of `engine` are recorded for.
    pub fn family_index(&self, engine: EngineType) -> u32 {
        match engine {
            EngineType::Direct => self.direct_family,
            EngineType::Copy => self.copy_family,
        }
    }

    /// # Safety
    /// `queue_index` must be less than the number of queues created for `family_index`, and
    /// `capabilities` must be the flags that family reported.
    pub unsafe fn queue(
        &self,
        family_index: u32,
        queue_index: u32,
        capabilities: vk::QueueFlags,
    ) -> VulkanQueue {
        let handle = unsafe { self.device.get_device_queue(family_index, queue_index) };
        VulkanQueue {
            device: self.device.clone(),
            handle,
            family_index,
            capabilities,
        }
    }

    fn create_pool(&self, family_index: u32) -> VkResult<vk::CommandPool> {
        unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT
                        | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    queue_family_index: family_index,
                    ..Default::default()
                },
                None,
            )
        }
    }
}

impl RawDevice<Vulkan> for VulkanDevice {
    fn create_command_allocator(&self, kind: EngineType) -> VkResult<VulkanAllocator> {
        let family_index = self.family_index(kind);
        let handle = self.create_pool(family_index)?;
        tracing::debug!(?handle, %kind, family_index, "created command pool");
        Ok(VulkanAllocator {
            device: self.device.clone(),
            handle,
            family_index,
            kind,
            lists: 0,
        })
    }

    fn create_command_list(
        &self,
        engine: EngineType,
        allocator: &mut VulkanAllocator,
    ) -> VkResult<VulkanCommandList> {
        let family_index = self.family_index(engine);
        if allocator.family_index != family_index {
            // Pools are tied to one queue family. An empty pool can move to another one.
            if allocator.lists != 0 {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            let handle = self.create_pool(family_index)?;
            unsafe {
                self.device.destroy_command_pool(allocator.handle, None);
            }
            tracing::debug!(
                from = allocator.family_index,
                to = family_index,
                "moved empty command pool to another queue family"
            );
            allocator.handle = handle;
            allocator.family_index = family_index;
        }

        let buffer = unsafe {
            self.device.allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                command_pool: allocator.handle,
                command_buffer_count: 1,
                level: vk::CommandBufferLevel::PRIMARY,
                ..Default::default()
            })?[0]
        };
        allocator.lists += 1;
        let mut list = VulkanCommandList {
            device: self.device.clone(),
            buffer,
            pool: allocator.handle,
            family_index,
            engine,
            state: BufferState::Initial,
        };
        list.open()?;
        Ok(list)
    }

    fn create_fence(&self) -> VkResult<VulkanFence> {
        let handle = unsafe {
            let mut type_info = vk::SemaphoreTypeCreateInfo {
                semaphore_type: vk::SemaphoreType::TIMELINE,
                initial_value: 0,
                ..Default::default()
            };
            let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            self.device.create_semaphore(&info, None)
        }?;
        Ok(VulkanFence {
            device: self.device.clone(),
            handle,
            value: AtomicU64::new(0),
        })
    }
}

/// A command pool.
pub struct VulkanAllocator {
    device: ash::Device,
    handle: vk::CommandPool,
    family_index: u32,
    kind: EngineType,
    /// Command buffers allocated from this pool.
    lists: u32,
}

impl VulkanAllocator {
    pub fn kind(&self) -> EngineType {
        self.kind
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

impl AsVkHandle for VulkanAllocator {
    type Handle = vk::CommandPool;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl RawAllocator for VulkanAllocator {
    fn reset(&mut self) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_pool(self.handle, vk::CommandPoolResetFlags::empty())
        }
    }
}

impl Drop for VulkanAllocator {
    fn drop(&mut self) {
        tracing::debug!(handle = ?self.handle, "destroying command pool");
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Needs `vkBeginCommandBuffer` before it accepts commands.
    Initial,
    Recording,
    Executable,
}

/// A primary command buffer.
pub struct VulkanCommandList {
    device: ash::Device,
    buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    family_index: u32,
    engine: EngineType,
    state: BufferState,
}

impl VulkanCommandList {
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// The device the buffer was allocated from, for recording commands into it.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn begin(&mut self) -> VkResult<()> {
        unsafe {
            self.device.begin_command_buffer(
                self.buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }
        self.state = BufferState::Recording;
        Ok(())
    }
}

impl AsVkHandle for VulkanCommandList {
    type Handle = vk::CommandBuffer;

    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl RawCommandList<Vulkan> for VulkanCommandList {
    fn open(&mut self) -> VkResult<()> {
        match self.state {
            BufferState::Recording => Ok(()),
            BufferState::Initial => self.begin(),
            BufferState::Executable => Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        }
    }

    fn close(&mut self) -> VkResult<()> {
        match self.state {
            BufferState::Executable => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
            BufferState::Initial => self.begin()?,
            BufferState::Recording => {}
        }
        unsafe {
            self.device.end_command_buffer(self.buffer)?;
        }
        self.state = BufferState::Executable;
        Ok(())
    }

    fn reset(&mut self, allocator: &VulkanAllocator) -> VkResult<()> {
        if allocator.handle != self.pool || self.state == BufferState::Recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        self.state = BufferState::Initial;
        Ok(())
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        unsafe {
            self.device.free_command_buffers(self.pool, &[self.buffer]);
        }
    }
}

/// A device queue.
pub struct VulkanQueue {
    device: ash::Device,
    handle: vk::Queue,
    family_index: u32,
    capabilities: vk::QueueFlags,
}

impl VulkanQueue {
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

impl AsVkHandle for VulkanQueue {
    type Handle = vk::Queue;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl RawQueue<Vulkan> for VulkanQueue {
    fn capabilities(&self) -> vk::QueueFlags {
        self.capabilities
    }

    /// Command buffers only run on queues of the family their pool was created for.
    fn supports(&self, list: &VulkanCommandList, engine: EngineType) -> bool {
        list.family_index == self.family_index && engine.is_supported_by(self.capabilities)
    }

    fn execute(&mut self, lists: &[&VulkanCommandList]) -> VkResult<()> {
        let mut infos: SmallVec<[vk::CommandBufferSubmitInfo; 4]> =
            SmallVec::with_capacity(lists.len());
        for list in lists {
            if list.state != BufferState::Executable || list.family_index != self.family_index {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            infos.push(vk::CommandBufferSubmitInfo {
                command_buffer: list.buffer,
                ..Default::default()
            });
        }
        unsafe {
            self.device.queue_submit2(
                self.handle,
                &[vk::SubmitInfo2::default().command_buffer_infos(&infos)],
                vk::Fence::null(),
            )
        }
    }

    fn signal(&mut self, fence: &VulkanFence, value: u64) -> VkResult<()> {
        unsafe {
            self.device.queue_submit2(
                self.handle,
                &[vk::SubmitInfo2::default().signal_semaphore_infos(&[
                    vk::SemaphoreSubmitInfo {
                        semaphore: fence.handle,
                        value,
                        stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                        ..Default::default()
                    },
                ])],
                vk::Fence::null(),
            )
        }
    }
}

/// A timeline semaphore.
pub struct VulkanFence {
    device: ash::Device,
    handle: vk::Semaphore,
    /// Last value observed on the host.
    value: AtomicU64,
}

impl AsVkHandle for VulkanFence {
    type Handle = vk::Semaphore;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl RawFence for VulkanFence {
    fn completed_value(&self) -> VkResult<u64> {
        let value = unsafe { self.device.get_semaphore_counter_value(self.handle)? };
        let previous = self.value.fetch_max(value, Ordering::Relaxed);
        Ok(previous.max(value))
    }

    fn wait(&self, value: u64, timeout_ns: u64) -> VkResult<()> {
        if self.value.load(Ordering::Relaxed) >= value {
            return Ok(());
        }
        unsafe {
            self.device.wait_semaphores(
                &vk::SemaphoreWaitInfo::default()
                    .semaphores(std::slice::from_ref(&self.handle))
                    .values(std::slice::from_ref(&value)),
                timeout_ns,
            )?;
        }
        self.value.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}
