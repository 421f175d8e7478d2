//! In-memory [`Device`] and [`PresentSurface`] implementations.
//!
//! Handles are counters and device memory is a byte vector per allocation.
//! Buffer copies recorded into a command buffer take effect when that buffer
//! is submitted. A submission's fence becomes signalled after a configurable
//! latency on a simulated clock that only moves when a wait blocks, so tests
//! can observe exactly which fence was waited on and for how long.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::device::{Device, PresentSurface, Submission};
use crate::error::Result;

const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 4096;

/// A buffer memory barrier as it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedBufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub offset: u64,
    pub size: u64,
}

/// An image memory barrier as it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedImageBarrier {
    pub image: vk::Image,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// A recorded `vkCmdPipelineBarrier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    /// `(src_access, dst_access)` of each global barrier.
    pub memory: Vec<(vk::AccessFlags, vk::AccessFlags)>,
    pub buffers: Vec<RecordedBufferBarrier>,
    pub images: Vec<RecordedImageBarrier>,
}

/// A command recorded into a fake command buffer.
#[derive(Debug, Clone)]
pub enum FakeCommand {
    Barrier(RecordedBarrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_value_count: usize,
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    SetViewport(Vec<vk::Viewport>),
    SetScissor(Vec<vk::Rect2D>),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<u64>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
}

/// A recorded queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// A recorded present request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPresent {
    pub queue: vk::Queue,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

/// Creation parameters of a fake swapchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSwapchainInfo {
    pub min_image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Signaled,
    Pending { ready_at: u64 },
    Never,
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    After(u64),
    Never,
}

struct FakeMemory {
    bytes: Vec<u8>,
    type_index: u32,
}

struct FakeBuffer {
    size: u64,
    binding: Option<(vk::DeviceMemory, u64)>,
}

struct FakeImage {
    format: vk::Format,
    extent: vk::Extent3D,
    requirements_size: u64,
    binding: Option<(vk::DeviceMemory, u64)>,
}

struct FakeState {
    next_handle: u64,
    memory_types: Vec<vk::MemoryType>,
    live: HashMap<u64, &'static str>,
    destroyed: HashMap<&'static str, usize>,
    invalid_destroys: usize,
    memories: HashMap<u64, FakeMemory>,
    buffers: HashMap<u64, FakeBuffer>,
    images: HashMap<u64, FakeImage>,
    image_views: HashMap<u64, (vk::Image, vk::Format)>,
    framebuffers: HashMap<u64, (vk::RenderPass, Vec<vk::ImageView>, vk::Extent2D)>,
    fences: HashMap<u64, FenceState>,
    command_buffers: HashMap<u64, (vk::CommandPool, Vec<FakeCommand>)>,
    swapchains: HashMap<u64, FakeSwapchainInfo>,
    acquire_cursor: HashMap<u64, u32>,
    signaled_semaphores: HashSet<u64>,
    clock_ns: u64,
    completion: Completion,
    fence_waits: Vec<vk::Fence>,
    submissions: Vec<RecordedSubmission>,
    presents: Vec<RecordedPresent>,
    failures: HashMap<&'static str, vk::Result>,
    suboptimal: bool,
    wait_idle_count: usize,
}

impl FakeState {
    fn new_handle(&mut self, kind: &'static str) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        self.next_handle
    }

    fn destroy(&mut self, raw: u64, kind: &'static str) -> bool {
        match self.live.get(&raw) {
            Some(&live_kind) if live_kind == kind => {
                self.live.remove(&raw);
                *self.destroyed.entry(kind).or_default() += 1;
                true
            }
            _ => {
                self.invalid_destroys += 1;
                false
            }
        }
    }

    fn take_failure(&mut self, op: &'static str) -> VkResult<()> {
        self.failures.remove(op).map_or(Ok(()), Err)
    }

    fn push_command(&mut self, cmd: vk::CommandBuffer, command: FakeCommand) {
        if let Some((_, commands)) = self.command_buffers.get_mut(&cmd.as_raw()) {
            commands.push(command);
        }
    }

    fn memory_range(
        &self,
        binding: Option<(vk::DeviceMemory, u64)>,
        offset: u64,
        size: u64,
    ) -> Option<(u64, usize, usize)> {
        let (memory, base) = binding?;
        let start = usize::try_from(base + offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        let len = self.memories.get(&memory.as_raw())?.bytes.len();
        (len >= end).then_some((memory.as_raw(), start, end))
    }

    fn execute_copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) -> VkResult<()> {
        let src_binding = self.buffers.get(&src.as_raw()).and_then(|b| b.binding);
        let dst_binding = self.buffers.get(&dst.as_raw()).and_then(|b| b.binding);
        let (src_mem, src_start, src_end) = self
            .memory_range(src_binding, region.src_offset, region.size)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let (dst_mem, dst_start, dst_end) = self
            .memory_range(dst_binding, region.dst_offset, region.size)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;

        let bytes = self.memories[&src_mem].bytes[src_start..src_end].to_vec();
        if let Some(memory) = self.memories.get_mut(&dst_mem) {
            memory.bytes[dst_start..dst_end].copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn complete_ready_fences(&mut self) {
        let now = self.clock_ns;
        for state in self.fences.values_mut() {
            if let FenceState::Pending { ready_at } = *state {
                if ready_at <= now {
                    *state = FenceState::Signaled;
                }
            }
        }
    }
}

/// A [`Device`] that lives entirely in host memory.
pub struct FakeDevice {
    state: Mutex<FakeState>,
}

impl FakeDevice {
    /// A device with one device-local and one host-visible coherent memory type.
    pub fn new() -> Arc<Self> {
        Self::with_memory_types(vec![
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
        ])
    }

    /// A device exposing exactly `memory_types`.
    pub fn with_memory_types(memory_types: Vec<vk::MemoryType>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_handle: 0,
                memory_types,
                live: HashMap::new(),
                destroyed: HashMap::new(),
                invalid_destroys: 0,
                memories: HashMap::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
                image_views: HashMap::new(),
                framebuffers: HashMap::new(),
                fences: HashMap::new(),
                command_buffers: HashMap::new(),
                swapchains: HashMap::new(),
                acquire_cursor: HashMap::new(),
                signaled_semaphores: HashSet::new(),
                clock_ns: 0,
                completion: Completion::After(0),
                fence_waits: Vec::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                failures: HashMap::new(),
                suboptimal: false,
                wait_idle_count: 0,
            }),
        })
    }

    /// Fences of later submissions signal `latency` after the submit.
    pub fn complete_submissions_after(&self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.state.lock().completion = Completion::After(ns);
    }

    /// Fences of later submissions never signal.
    pub fn never_complete_submissions(&self) {
        self.state.lock().completion = Completion::Never;
    }

    /// Make the next call of `op` (the `Device` method name) fail with `result`.
    pub fn fail_next(&self, op: &'static str, result: vk::Result) {
        self.state.lock().failures.insert(op, result);
    }

    /// Report later acquires and presents as suboptimal.
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal = suboptimal;
    }

    /// Simulated time elapsed so far.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.state.lock().clock_ns)
    }

    /// Move the simulated clock forward, signalling fences that became ready.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        state.clock_ns = state.clock_ns.saturating_add(ns);
        state.complete_ready_fences();
    }

    /// Every fence passed to `wait_for_fence`, in call order.
    pub fn fence_waits(&self) -> Vec<vk::Fence> {
        self.state.lock().fence_waits.clone()
    }

    pub fn clear_fence_waits(&self) {
        self.state.lock().fence_waits.clear();
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn presents(&self) -> Vec<RecordedPresent> {
        self.state.lock().presents.clone()
    }

    /// Commands recorded since the command buffer was last begun or reset.
    pub fn commands(&self, cmd: vk::CommandBuffer) -> Vec<FakeCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map(|(_, commands)| commands.clone())
            .unwrap_or_default()
    }

    /// Barriers recorded into `cmd`.
    pub fn barriers(&self, cmd: vk::CommandBuffer) -> Vec<RecordedBarrier> {
        self.commands(cmd)
            .into_iter()
            .filter_map(|command| match command {
                FakeCommand::Barrier(barrier) => Some(barrier),
                _ => None,
            })
            .collect()
    }

    /// Number of live objects of `kind` (`"buffer"`, `"memory"`, `"fence"`, ...).
    pub fn live_count(&self, kind: &str) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    /// Number of successful destroys of `kind`.
    pub fn destroy_count(&self, kind: &str) -> usize {
        self.state.lock().destroyed.get(kind).copied().unwrap_or(0)
    }

    /// Destroy calls on handles that were unknown, already destroyed or of the wrong kind.
    pub fn invalid_destroys(&self) -> usize {
        self.state.lock().invalid_destroys
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.lock().wait_idle_count
    }

    /// Memory and offset a buffer is bound to.
    pub fn buffer_binding(&self, buffer: vk::Buffer) -> Option<(vk::DeviceMemory, u64)> {
        self.state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .and_then(|b| b.binding)
    }

    pub fn image_binding(&self, image: vk::Image) -> Option<(vk::DeviceMemory, u64)> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .and_then(|i| i.binding)
    }

    /// Format and extent an image was created with.
    pub fn image_info(&self, image: vk::Image) -> Option<(vk::Format, vk::Extent3D)> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .map(|i| (i.format, i.extent))
    }

    /// Memory type an allocation was made from.
    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state
            .lock()
            .memories
            .get(&memory.as_raw())
            .map(|m| m.type_index)
    }

    /// Image and format a view was created for.
    pub fn image_view_info(&self, view: vk::ImageView) -> Option<(vk::Image, vk::Format)> {
        self.state.lock().image_views.get(&view.as_raw()).copied()
    }

    pub fn framebuffer_info(
        &self,
        framebuffer: vk::Framebuffer,
    ) -> Option<(vk::RenderPass, Vec<vk::ImageView>, vk::Extent2D)> {
        self.state
            .lock()
            .framebuffers
            .get(&framebuffer.as_raw())
            .cloned()
    }

    pub fn swapchain_info(&self, swapchain: vk::SwapchainKHR) -> Option<FakeSwapchainInfo> {
        self.state.lock().swapchains.get(&swapchain.as_raw()).cloned()
    }

    /// Whether a fence is currently signalled on the simulated clock.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        let state = self.state.lock();
        match state.fences.get(&fence.as_raw()) {
            Some(FenceState::Signaled) => true,
            Some(FenceState::Pending { ready_at }) => *ready_at <= state.clock_ns,
            _ => false,
        }
    }

    /// Whether `semaphore` has been signalled by an acquire and not yet waited on.
    pub fn is_semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .signaled_semaphores
            .contains(&semaphore.as_raw())
    }
}

impl Device for FakeDevice {
    fn memory_types(&self) -> Vec<vk::MemoryType> {
        self.state.lock().memory_types.clone()
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        state.take_failure("allocate_memory")?;
        let len = usize::try_from(size).map_err(|_| vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let raw = state.new_handle("memory");
        state.memories.insert(
            raw,
            FakeMemory {
                bytes: vec![0; len],
                type_index: memory_type_index,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if state.destroy(memory.as_raw(), "memory") {
            state.memories.remove(&memory.as_raw());
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        state.take_failure("map_memory")?;
        let host_visible_types: Vec<bool> = state
            .memory_types
            .iter()
            .map(|t| t.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE))
            .collect();
        let fake = state
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let host_visible = usize::try_from(fake.type_index)
            .ok()
            .and_then(|i| host_visible_types.get(i).copied())
            .unwrap_or(false);
        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let in_range = size == vk::WHOLE_SIZE
            || usize::try_from(size)
                .ok()
                .and_then(|len| start.checked_add(len))
                .is_some_and(|end| end <= fake.bytes.len());
        if !host_visible || start > fake.bytes.len() || !in_range {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(fake.bytes.as_mut_ptr().wrapping_add(start))
    }

    fn flush_mapped_range(
        &self,
        _memory: vk::DeviceMemory,
        _offset: u64,
        _size: u64,
    ) -> VkResult<()> {
        self.state.lock().take_failure("flush_mapped_range")
    }

    fn invalidate_mapped_range(
        &self,
        _memory: vk::DeviceMemory,
        _offset: u64,
        _size: u64,
    ) -> VkResult<()> {
        self.state.lock().take_failure("invalidate_mapped_range")
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        state.take_failure("create_buffer")?;
        let raw = state.new_handle("buffer");
        state.buffers.insert(
            raw,
            FakeBuffer {
                size: info.size,
                binding: None,
            },
        );
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.destroy(buffer.as_raw(), "buffer") {
            state.buffers.remove(&buffer.as_raw());
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: size.max(1).next_multiple_of(BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: all_type_bits(state.memory_types.len()),
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("bind_buffer_memory")?;
        let buffer = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if buffer.binding.is_some() {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        buffer.binding = Some((memory, offset));
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        state.take_failure("create_image")?;
        let texels = u64::from(info.extent.width)
            * u64::from(info.extent.height)
            * u64::from(info.extent.depth.max(1))
            * u64::from(info.array_layers.max(1));
        let raw = state.new_handle("image");
        state.images.insert(
            raw,
            FakeImage {
                format: info.format,
                extent: info.extent,
                requirements_size: (texels * 4).max(1).next_multiple_of(IMAGE_ALIGNMENT),
                binding: None,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if state.destroy(image.as_raw(), "image") {
            state.images.remove(&image.as_raw());
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        vk::MemoryRequirements {
            size: state
                .images
                .get(&image.as_raw())
                .map_or(IMAGE_ALIGNMENT, |i| i.requirements_size),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: all_type_bits(state.memory_types.len()),
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("bind_image_memory")?;
        let image = state
            .images
            .get_mut(&image.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if image.binding.is_some() {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        image.binding = Some((memory, offset));
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        state.take_failure("create_image_view")?;
        let raw = state.new_handle("image_view");
        state.image_views.insert(raw, (info.image, info.format));
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.destroy(view.as_raw(), "image_view") {
            state.image_views.remove(&view.as_raw());
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.take_failure("create_fence")?;
        let raw = state.new_handle("fence");
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.destroy(fence.as_raw(), "fence") {
            state.fences.remove(&fence.as_raw());
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fence_waits.push(fence);
        state.take_failure("wait_for_fence")?;
        let now = state.clock_ns;
        let deadline = now.saturating_add(timeout_ns);
        let current = *state
            .fences
            .get(&fence.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        match current {
            FenceState::Signaled => Ok(()),
            FenceState::Pending { ready_at } if ready_at <= deadline => {
                state.clock_ns = now.max(ready_at);
                state.complete_ready_fences();
                Ok(())
            }
            FenceState::Pending { .. } | FenceState::Unsignaled | FenceState::Never => {
                state.clock_ns = deadline;
                state.complete_ready_fences();
                Err(vk::Result::TIMEOUT)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("reset_fence")?;
        let slot = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *slot = FenceState::Unsignaled;
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.take_failure("fence_signaled")?;
        state.complete_ready_fences();
        match state.fences.get(&fence.as_raw()) {
            Some(fence_state) => Ok(*fence_state == FenceState::Signaled),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.take_failure("create_semaphore")?;
        Ok(vk::Semaphore::from_raw(state.new_handle("semaphore")))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.destroy(semaphore.as_raw(), "semaphore");
        state.signaled_semaphores.remove(&semaphore.as_raw());
    }

    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        state.take_failure("create_command_pool")?;
        Ok(vk::CommandPool::from_raw(state.new_handle("command_pool")))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if state.destroy(pool.as_raw(), "command_pool") {
            // Destroying a pool implicitly frees its remaining buffers.
            let orphans: Vec<u64> = state
                .command_buffers
                .iter()
                .filter(|(_, (owner, _))| *owner == pool)
                .map(|(raw, _)| *raw)
                .collect();
            for raw in orphans {
                state.command_buffers.remove(&raw);
                state.live.remove(&raw);
            }
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.take_failure("allocate_command_buffers")?;
        if !state.live.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok((0..count)
            .map(|_| {
                let raw = state.new_handle("command_buffer");
                state.command_buffers.insert(raw, (pool, Vec::new()));
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            let owned = state
                .command_buffers
                .get(&cmd.as_raw())
                .is_some_and(|(owner, _)| *owner == pool);
            if owned && state.destroy(cmd.as_raw(), "command_buffer") {
                state.command_buffers.remove(&cmd.as_raw());
            } else if !owned {
                state.invalid_destroys += 1;
            }
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("begin_command_buffer")?;
        let (_, commands) = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().take_failure("end_command_buffer")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("reset_command_buffer")?;
        if let Some((_, commands)) = state.command_buffers.get_mut(&cmd.as_raw()) {
            commands.clear();
        }
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let barrier = RecordedBarrier {
            src_stage,
            dst_stage,
            dependency_flags,
            memory: memory_barriers
                .iter()
                .map(|b| (b.src_access_mask, b.dst_access_mask))
                .collect(),
            buffers: buffer_barriers
                .iter()
                .map(|b| RecordedBufferBarrier {
                    buffer: b.buffer,
                    src_access: b.src_access_mask,
                    dst_access: b.dst_access_mask,
                    src_queue_family: b.src_queue_family_index,
                    dst_queue_family: b.dst_queue_family_index,
                    offset: b.offset,
                    size: b.size,
                })
                .collect(),
            images: image_barriers
                .iter()
                .map(|b| RecordedImageBarrier {
                    image: b.image,
                    src_access: b.src_access_mask,
                    dst_access: b.dst_access_mask,
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_queue_family: b.src_queue_family_index,
                    dst_queue_family: b.dst_queue_family_index,
                    aspect: b.subresource_range.aspect_mask,
                    base_mip_level: b.subresource_range.base_mip_level,
                    level_count: b.subresource_range.level_count,
                    base_array_layer: b.subresource_range.base_array_layer,
                    layer_count: b.subresource_range.layer_count,
                })
                .collect(),
        };
        self.state
            .lock()
            .push_command(cmd, FakeCommand::Barrier(barrier));
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                render_area,
                clear_value_count: clear_values.len(),
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().push_command(cmd, FakeCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state
            .lock()
            .push_command(cmd, FakeCommand::BindPipeline(pipeline));
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, _first: u32, viewports: &[vk::Viewport]) {
        self.state
            .lock()
            .push_command(cmd, FakeCommand::SetViewport(viewports.to_vec()));
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, _first: u32, scissors: &[vk::Rect2D]) {
        self.state
            .lock()
            .push_command(cmd, FakeCommand::SetScissor(scissors.to_vec()));
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
                offsets: offsets.to_vec(),
            },
        );
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::BindDescriptorSets {
                layout,
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.lock().push_command(
            cmd,
            FakeCommand::PushConstants {
                stages,
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("queue_submit")?;

        if fence != vk::Fence::null() {
            match state.fences.get(&fence.as_raw()) {
                Some(FenceState::Unsignaled) => {}
                // Submitting with a fence that is not unsignaled is invalid usage.
                _ => return Err(vk::Result::ERROR_UNKNOWN),
            }
        }

        for cmd in submission.command_buffers {
            let copies: Vec<_> = state
                .command_buffers
                .get(&cmd.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?
                .1
                .iter()
                .filter_map(|command| match command {
                    FakeCommand::CopyBuffer { src, dst, regions } => {
                        Some((*src, *dst, regions.clone()))
                    }
                    _ => None,
                })
                .collect();
            for (src, dst, regions) in copies {
                for region in regions {
                    state.execute_copy(src, dst, region)?;
                }
            }
        }

        for semaphore in submission.wait_semaphores {
            state.signaled_semaphores.remove(&semaphore.as_raw());
        }
        for semaphore in submission.signal_semaphores {
            state.signaled_semaphores.insert(semaphore.as_raw());
        }

        if fence != vk::Fence::null() {
            let next = match state.completion {
                Completion::After(latency) => FenceState::Pending {
                    ready_at: state.clock_ns.saturating_add(latency),
                },
                Completion::Never => FenceState::Never,
            };
            state.fences.insert(fence.as_raw(), next);
        }

        state.submissions.push(RecordedSubmission {
            queue,
            command_buffers: submission.command_buffers.to_vec(),
            wait_semaphores: submission.wait_semaphores.to_vec(),
            wait_stages: submission.wait_stages.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("device_wait_idle")?;
        state.wait_idle_count += 1;
        let latest = state
            .fences
            .values()
            .filter_map(|f| match f {
                FenceState::Pending { ready_at } => Some(*ready_at),
                _ => None,
            })
            .max();
        if let Some(latest) = latest {
            state.clock_ns = state.clock_ns.max(latest);
            state.complete_ready_fences();
        }
        Ok(())
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        state.take_failure("create_render_pass")?;
        Ok(vk::RenderPass::from_raw(state.new_handle("render_pass")))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .lock()
            .destroy(render_pass.as_raw(), "render_pass");
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        state.take_failure("create_framebuffer")?;
        let raw = state.new_handle("framebuffer");
        state
            .framebuffers
            .insert(raw, (render_pass, attachments.to_vec(), extent));
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        if state.destroy(framebuffer.as_raw(), "framebuffer") {
            state.framebuffers.remove(&framebuffer.as_raw());
        }
    }

    fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        state.take_failure("create_swapchain")?;
        let raw = state.new_handle("swapchain");
        // Presentable images belong to the swapchain; they are not live objects of their own.
        let images = (0..info.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchains.insert(
            raw,
            FakeSwapchainInfo {
                min_image_count: info.min_image_count,
                format: info.image_format,
                color_space: info.image_color_space,
                extent: info.image_extent,
                usage: info.image_usage,
                transform: info.pre_transform,
                present_mode: info.present_mode,
                old_swapchain: info.old_swapchain,
                images,
            },
        );
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if state.destroy(swapchain.as_raw(), "swapchain") {
            state.swapchains.remove(&swapchain.as_raw());
            state.acquire_cursor.remove(&swapchain.as_raw());
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut state = self.state.lock();
        state.take_failure("swapchain_images")?;
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|info| info.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.take_failure("acquire_next_image")?;
        let count = state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|info| info.images.len())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let count = u32::try_from(count).map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        if count == 0 {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let cursor = state.acquire_cursor.entry(swapchain.as_raw()).or_insert(0);
        let index = *cursor % count;
        *cursor = cursor.wrapping_add(1);
        if semaphore != vk::Semaphore::null() {
            state.signaled_semaphores.insert(semaphore.as_raw());
        }
        Ok((index, state.suboptimal))
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.take_failure("queue_present")?;
        for semaphore in wait_semaphores {
            state.signaled_semaphores.remove(&semaphore.as_raw());
        }
        state.presents.push(RecordedPresent {
            queue,
            wait_semaphores: wait_semaphores.to_vec(),
            swapchain,
            image_index,
        });
        Ok(state.suboptimal)
    }
}

fn all_type_bits(count: usize) -> u32 {
    match u32::try_from(count) {
        Ok(n) if n < 32 => (1u32 << n) - 1,
        _ => u32::MAX,
    }
}

struct FakeSurfaceState {
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    window_extent: vk::Extent2D,
}

/// A [`PresentSurface`] whose answers tests can change at will.
pub struct FakeSurface {
    state: Mutex<FakeSurfaceState>,
}

impl FakeSurface {
    /// An 800x600 surface supporting FIFO and MAILBOX in `B8G8R8A8` formats.
    pub fn new() -> Arc<Self> {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        Arc::new(Self {
            state: Mutex::new(FakeSurfaceState {
                capabilities: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 8,
                    current_extent: extent,
                    min_image_extent: vk::Extent2D {
                        width: 1,
                        height: 1,
                    },
                    max_image_extent: vk::Extent2D {
                        width: 4096,
                        height: 4096,
                    },
                    max_image_array_layers: 1,
                    supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                    supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_DST,
                },
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                window_extent: extent,
            }),
        })
    }

    pub fn update_capabilities(&self, f: impl FnOnce(&mut vk::SurfaceCapabilitiesKHR)) {
        f(&mut self.state.lock().capabilities);
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().formats = formats;
    }

    pub fn set_present_modes(&self, present_modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = present_modes;
    }

    /// Simulate a window resize: both the window and the surface's current extent change.
    pub fn resize(&self, extent: vk::Extent2D) {
        let mut state = self.state.lock();
        state.window_extent = extent;
        state.capabilities.current_extent = extent;
    }

    pub fn set_window_extent(&self, extent: vk::Extent2D) {
        self.state.lock().window_extent = extent;
    }
}

impl PresentSurface for FakeSurface {
    fn handle(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(u64::MAX)
    }

    fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn window_extent(&self) -> vk::Extent2D {
        self.state.lock().window_extent
    }
}
