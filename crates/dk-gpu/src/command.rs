//! Command buffer recording and command pools.
//!
//! A [`CommandPool`] owns every command buffer it allocates. Callers hold a
//! [`CommandBufferId`] and borrow the [`CommandBuffer`] through the pool when
//! they want to record into it. Each buffer tracks where it is in its
//! recording lifecycle and refuses commands that are not legal there:
//!
//! | operation | legal in | becomes |
//! |---|---|---|
//! | `begin_recording` | Idle | Recording |
//! | `pipeline_barrier`, `copy_buffer` | Recording | |
//! | `begin_render_pass` | Recording | InRenderPass |
//! | `bind_pipeline`, `set_viewport`, `set_scissor`, `bind_vertex_buffers`, `draw` | InRenderPass | |
//! | `bind_descriptor_set`, `push_constants` | Recording, InRenderPass | |
//! | `end_render_pass` | InRenderPass | Recording |
//! | `end_recording` | Recording | Ended |
//! | `submit` | Ended | Submitted |
//! | `reset` | Idle, Ended, Submitted | Idle |

use ash::vk;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, error};

use crate::buffer::Buffer;
use crate::device::{DeviceRef, Queue, Submission};
use crate::error::{reject, GpuError, Rejected, Result, SetResult};
use crate::frame::FrameResources;
use crate::mesh::Mesh;
use crate::sync::{Fence, WaitSemaphore};

/// Where a command buffer is in its recording lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    /// Allocated (or reset) and ready to record.
    Idle,
    /// Recording outside a render pass.
    Recording,
    /// Recording inside a render pass.
    InRenderPass,
    /// Recording finished; ready to submit.
    Ended,
    /// Handed to a queue. The caller tracks when execution completes.
    Submitted,
}

/// An execution and memory dependency for all resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// A dependency on the whole of one buffer, optionally transferring queue ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    /// A barrier that leaves queue ownership alone.
    pub const fn new(
        buffer: vk::Buffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self {
            buffer,
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    #[must_use]
    pub const fn queue_families(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family = src;
        self.dst_queue_family = dst;
        self
    }
}

/// A dependency and layout transition on every mip level and layer of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    /// A colour-aspect barrier that keeps the layout and queue ownership.
    pub const fn new(
        image: vk::Image,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            src_access,
            dst_access,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    #[must_use]
    pub const fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    #[must_use]
    pub const fn layouts(mut self, old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        self.old_layout = old;
        self.new_layout = new;
        self
    }

    #[must_use]
    pub const fn queue_families(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family = src;
        self.dst_queue_family = dst;
        self
    }
}

/// One `vkCmdPipelineBarrier` call.
#[derive(Debug, Clone, Default)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    pub global: Vec<GlobalBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    pub fn new(src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn global(mut self, barrier: GlobalBarrier) -> Self {
        self.global.push(barrier);
        self
    }

    #[must_use]
    pub fn buffer(mut self, barrier: BufferBarrier) -> Self {
        self.buffers.push(barrier);
        self
    }

    #[must_use]
    pub fn image(mut self, barrier: ImageBarrier) -> Self {
        self.images.push(barrier);
        self
    }

    #[must_use]
    pub const fn dependency_flags(mut self, flags: vk::DependencyFlags) -> Self {
        self.dependency_flags = flags;
        self
    }
}

/// Stages and accesses on either side of a queue ownership transfer.
#[derive(Debug, Clone, Copy)]
pub struct QueueTransfer {
    /// Queue that currently owns the resource.
    pub from: Queue,
    /// Queue that will own the resource.
    pub to: Queue,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl QueueTransfer {
    /// Whether the transfer crosses queue families and so needs a barrier.
    pub const fn is_needed(&self) -> bool {
        !self.from.shares_family(&self.to)
    }
}

/// Parameters of `vkCmdBeginRenderPass`.
#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

/// A command buffer owned by a [`CommandPool`].
pub struct CommandBuffer {
    device: DeviceRef,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    state: RecordingState,
    resettable: bool,
}

impl CommandBuffer {
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Native pool this buffer was allocated from.
    pub const fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub const fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub const fn state(&self) -> RecordingState {
        self.state
    }

    /// Whether the owning pool allows [`Self::reset`] on individual buffers.
    pub const fn is_resettable(&self) -> bool {
        self.resettable
    }

    fn require_state(&self, operation: &'static str, legal: &[RecordingState]) -> Result<()> {
        if legal.contains(&self.state) {
            Ok(())
        } else {
            Err(GpuError::InvalidCommandState {
                operation,
                state: self.state,
            })
        }
    }

    pub fn begin_recording(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<()> {
        self.require_state("begin recording", &[RecordingState::Idle])?;
        self.device
            .begin_command_buffer(self.cmd, usage)
            .map_err(|e| {
                error!("Failed to begin command buffer: {e}");
                GpuError::from(e)
            })?;
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Record a pipeline barrier. Buffer barriers cover the whole buffer and
    /// image barriers every mip level and array layer.
    pub fn pipeline_barrier(&mut self, barrier: &PipelineBarrier) -> Result<()> {
        self.require_state("record a barrier", &[RecordingState::Recording])?;

        let global: Vec<_> = barrier
            .global
            .iter()
            .map(|b| {
                vk::MemoryBarrier::default()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
            })
            .collect();
        let buffers: Vec<_> = barrier
            .buffers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier::default()
                    .buffer(b.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(b.src_queue_family)
                    .dst_queue_family_index(b.dst_queue_family)
            })
            .collect();
        let images: Vec<_> = barrier
            .images
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier::default()
                    .image(b.image)
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(b.src_queue_family)
                    .dst_queue_family_index(b.dst_queue_family)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: b.aspect,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
            })
            .collect();

        self.device.cmd_pipeline_barrier(
            self.cmd,
            barrier.src_stage,
            barrier.dst_stage,
            barrier.dependency_flags,
            &global,
            &buffers,
            &images,
        );
        Ok(())
    }

    /// Record a release/acquire barrier moving `buffer` between queue families.
    ///
    /// Records nothing when both queues share a family; returns whether a
    /// barrier was recorded.
    pub fn transfer_buffer_ownership(
        &mut self,
        buffer: vk::Buffer,
        transfer: &QueueTransfer,
    ) -> Result<bool> {
        self.require_state("record a barrier", &[RecordingState::Recording])?;
        if !transfer.is_needed() {
            return Ok(false);
        }
        let barrier = PipelineBarrier::new(transfer.src_stage, transfer.dst_stage).buffer(
            BufferBarrier::new(buffer, transfer.src_access, transfer.dst_access)
                .queue_families(transfer.from.family_index, transfer.to.family_index),
        );
        self.pipeline_barrier(&barrier)?;
        Ok(true)
    }

    /// Image counterpart of [`Self::transfer_buffer_ownership`].
    pub fn transfer_image_ownership(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        layouts: (vk::ImageLayout, vk::ImageLayout),
        transfer: &QueueTransfer,
    ) -> Result<bool> {
        self.require_state("record a barrier", &[RecordingState::Recording])?;
        if !transfer.is_needed() {
            return Ok(false);
        }
        let barrier = PipelineBarrier::new(transfer.src_stage, transfer.dst_stage).image(
            ImageBarrier::new(image, transfer.src_access, transfer.dst_access)
                .aspect(aspect)
                .layouts(layouts.0, layouts.1)
                .queue_families(transfer.from.family_index, transfer.to.family_index),
        );
        self.pipeline_barrier(&barrier)?;
        Ok(true)
    }

    /// Copy all of `src` to the start of `dst`.
    pub fn copy_buffer(&mut self, dst: &Buffer, src: &Buffer) -> Result<()> {
        self.require_state("copy buffers", &[RecordingState::Recording])?;
        if !src.is_initialized() || !dst.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot copy between uninitialized buffers".to_string(),
            ));
        }
        if dst.size() < src.size() {
            return Err(GpuError::InvalidState(format!(
                "copy of {} bytes does not fit a {} byte buffer",
                src.size(),
                dst.size()
            )));
        }
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size(),
        };
        self.device
            .cmd_copy_buffer(self.cmd, src.handle(), dst.handle(), &[region]);
        Ok(())
    }

    pub fn begin_render_pass(&mut self, begin: &RenderPassBegin<'_>) -> Result<()> {
        self.require_state("begin a render pass", &[RecordingState::Recording])?;
        self.device.cmd_begin_render_pass(
            self.cmd,
            begin.render_pass,
            begin.framebuffer,
            begin.render_area,
            begin.clear_values,
        );
        self.state = RecordingState::InRenderPass;
        Ok(())
    }

    pub fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> Result<()> {
        self.require_state("bind a pipeline", &[RecordingState::InRenderPass])?;
        self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline);
        Ok(())
    }

    pub fn set_viewport(&mut self, viewports: &[vk::Viewport]) -> Result<()> {
        self.require_state("set the viewport", &[RecordingState::InRenderPass])?;
        self.device.cmd_set_viewport(self.cmd, 0, viewports);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissors: &[vk::Rect2D]) -> Result<()> {
        self.require_state("set the scissor", &[RecordingState::InRenderPass])?;
        self.device.cmd_set_scissor(self.cmd, 0, scissors);
        Ok(())
    }

    /// Bind the vertex buffers of `meshes`, whose binding indices must be consecutive.
    pub fn bind_vertex_buffers(&mut self, meshes: &[&Mesh]) -> Result<()> {
        self.require_state("bind vertex buffers", &[RecordingState::InRenderPass])?;
        let Some(first) = meshes.first() else {
            return Err(GpuError::InvalidState(
                "no vertex buffers to bind".to_string(),
            ));
        };
        for pair in meshes.windows(2) {
            let (previous, found) = (pair[0].binding_index(), pair[1].binding_index());
            if previous.checked_add(1) != Some(found) {
                return Err(GpuError::NonContiguousBindings { previous, found });
            }
        }

        let buffers = meshes
            .iter()
            .map(|mesh| {
                mesh.vertex_buffer()
                    .filter(|buffer| buffer.is_initialized())
                    .map(Buffer::handle)
                    .ok_or_else(|| {
                        GpuError::InvalidState(format!(
                            "mesh at binding {} has no vertex buffer",
                            mesh.binding_index()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let offsets = vec![0; buffers.len()];
        self.device
            .cmd_bind_vertex_buffers(self.cmd, first.binding_index(), &buffers, &offsets);
        Ok(())
    }

    /// Draw every vertex of `mesh` `instances` times.
    pub fn draw(&mut self, mesh: &Mesh, instances: u32) -> Result<()> {
        self.require_state("draw", &[RecordingState::InRenderPass])?;
        self.device
            .cmd_draw(self.cmd, mesh.vertex_count(), instances, 0, 0);
        Ok(())
    }

    pub fn bind_descriptor_set(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        self.require_state(
            "bind descriptor sets",
            &[RecordingState::Recording, RecordingState::InRenderPass],
        )?;
        self.device
            .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets);
        Ok(())
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.require_state(
            "push constants",
            &[RecordingState::Recording, RecordingState::InRenderPass],
        )?;
        self.device
            .cmd_push_constants(self.cmd, layout, stages, offset, data);
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.require_state("end a render pass", &[RecordingState::InRenderPass])?;
        self.device.cmd_end_render_pass(self.cmd);
        self.state = RecordingState::Recording;
        Ok(())
    }

    pub fn end_recording(&mut self) -> Result<()> {
        self.require_state("end recording", &[RecordingState::Recording])?;
        self.device.end_command_buffer(self.cmd).map_err(|e| {
            error!("Failed to end command buffer: {e}");
            GpuError::from(e)
        })?;
        self.state = RecordingState::Ended;
        Ok(())
    }

    /// Submit to `queue`. `fence`, if given, must be unsignaled and is
    /// signalled when execution completes.
    pub fn submit(
        &mut self,
        queue: &Queue,
        waits: &[WaitSemaphore],
        signals: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        self.require_state("submit", &[RecordingState::Ended])?;

        let wait_semaphores: Vec<_> = waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<_> = waits.iter().map(|w| w.stage).collect();
        let command_buffers = [self.cmd];
        let submission = Submission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: signals,
        };

        self.device
            .queue_submit(
                queue.handle,
                &submission,
                fence.map_or(vk::Fence::null(), Fence::handle),
            )
            .map_err(|e| {
                error!("Queue submission failed: {e}");
                GpuError::from(e)
            })?;
        self.state = RecordingState::Submitted;
        Ok(())
    }

    /// Return to `Idle` so the buffer can be recorded again.
    ///
    /// The caller must know that a submitted buffer has finished executing.
    /// Fails when the pool was created without `RESET_COMMAND_BUFFER`.
    pub fn reset(&mut self) -> Result<()> {
        self.require_state(
            "reset",
            &[
                RecordingState::Idle,
                RecordingState::Ended,
                RecordingState::Submitted,
            ],
        )?;
        if !self.resettable {
            return Err(GpuError::InvalidState(
                "command pool does not allow resetting individual buffers".to_string(),
            ));
        }
        self.device.reset_command_buffer(self.cmd)?;
        self.state = RecordingState::Idle;
        Ok(())
    }
}

new_key_type! {
    struct CommandBufferKey;
}

/// Ticket for a command buffer owned by a [`CommandPool`].
///
/// Not `Copy` or `Clone`: [`CommandPool::free_buffer`] consumes it, so a
/// buffer cannot be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandBufferId {
    pool: vk::CommandPool,
    key: CommandBufferKey,
}

/// A command pool and every buffer allocated from it.
pub struct CommandPool {
    device: DeviceRef,
    pool: vk::CommandPool,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
    buffers: SlotMap<CommandBufferKey, CommandBuffer>,
}

impl CommandPool {
    /// Create an uninitialized pool for `queue_family` whose buffers can be reset individually.
    pub fn new(device: DeviceRef, queue_family: u32) -> Self {
        Self {
            device,
            pool: vk::CommandPool::null(),
            queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            buffers: SlotMap::with_key(),
        }
    }

    /// Create and initialize a pool for `queue`'s family.
    pub fn create(device: DeviceRef, queue: &Queue) -> Result<Self> {
        let mut pool = Self::new(device, queue.family_index);
        pool.init()?;
        Ok(pool)
    }

    pub fn set_flags(&mut self, flags: vk::CommandPoolCreateFlags) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("command pool flags"));
        }
        self.flags = flags;
        Ok(())
    }

    pub fn set_queue_family(&mut self, queue_family: u32) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("command pool queue family"));
        }
        self.queue_family = queue_family;
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        self.pool = self
            .device
            .create_command_pool(self.queue_family, self.flags)
            .map_err(|e| {
                error!("Failed to create command pool: {e}");
                GpuError::from(e)
            })?;
        debug!("Created command pool for queue family {}", self.queue_family);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.pool != vk::CommandPool::null()
    }

    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Number of live buffers owned by the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Allocate `count` buffers of `level`.
    pub fn allocate(
        &mut self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferId>> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot allocate from an uninitialized command pool".to_string(),
            ));
        }
        if count == 0 {
            return Err(GpuError::InvalidState(
                "cannot allocate zero command buffers".to_string(),
            ));
        }

        let handles = self
            .device
            .allocate_command_buffers(self.pool, level, count)
            .map_err(|e| {
                error!("Failed to allocate {count} command buffers: {e}");
                GpuError::from(e)
            })?;

        let resettable = self
            .flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(handles
            .into_iter()
            .map(|cmd| {
                let key = self.buffers.insert(CommandBuffer {
                    device: self.device.clone(),
                    pool: self.pool,
                    cmd,
                    level,
                    state: RecordingState::Idle,
                    resettable,
                });
                CommandBufferId {
                    pool: self.pool,
                    key,
                }
            })
            .collect())
    }

    /// Allocate a single buffer of `level`.
    pub fn allocate_one(&mut self, level: vk::CommandBufferLevel) -> Result<CommandBufferId> {
        self.allocate(level, 1)?
            .pop()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))
    }

    /// Give every frame slot its own primary buffer, freeing any it held before.
    pub fn allocate_for_frames(&mut self, frames: &mut [FrameResources]) -> Result<()> {
        let count = u32::try_from(frames.len())
            .map_err(|_| GpuError::InvalidState("too many frame slots".to_string()))?;
        for frame in frames.iter_mut() {
            if let Some(previous) = frame.take_command_buffer() {
                self.free_buffer(previous)?;
            }
        }
        let ids = self.allocate(vk::CommandBufferLevel::PRIMARY, count)?;
        for (frame, id) in frames.iter_mut().zip(ids) {
            frame.set_command_buffer(id);
        }
        Ok(())
    }

    fn key_of(&self, id: &CommandBufferId) -> Result<CommandBufferKey> {
        if id.pool == self.pool && self.buffers.contains_key(id.key) {
            Ok(id.key)
        } else {
            Err(GpuError::UnknownCommandBuffer)
        }
    }

    pub fn buffer(&self, id: &CommandBufferId) -> Result<&CommandBuffer> {
        let key = self.key_of(id)?;
        self.buffers.get(key).ok_or(GpuError::UnknownCommandBuffer)
    }

    pub fn buffer_mut(&mut self, id: &CommandBufferId) -> Result<&mut CommandBuffer> {
        let key = self.key_of(id)?;
        self.buffers
            .get_mut(key)
            .ok_or(GpuError::UnknownCommandBuffer)
    }

    /// Free one buffer immediately.
    pub fn free_buffer(&mut self, id: CommandBufferId) -> Result<()> {
        let key = self.key_of(&id)?;
        if let Some(buffer) = self.buffers.remove(key) {
            self.device.free_command_buffers(self.pool, &[buffer.cmd]);
        }
        Ok(())
    }

    /// Free every buffer, then destroy the pool. Safe to repeat.
    pub fn finalize(&mut self) {
        if !self.is_initialized() {
            return;
        }
        let handles: Vec<_> = self.buffers.drain().map(|(_, b)| b.cmd).collect();
        if !handles.is_empty() {
            self.device.free_command_buffers(self.pool, &handles);
        }
        self.device.destroy_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Queue;
    use crate::fake::{FakeCommand, FakeDevice};
    use ash::vk::Handle;
    use std::sync::Arc;

    const GRAPHICS: Queue = Queue {
        handle: vk::Queue::null(),
        family_index: 0,
    };
    const PRESENT: Queue = Queue {
        handle: vk::Queue::null(),
        family_index: 1,
    };

    fn pool(fake: &Arc<FakeDevice>) -> CommandPool {
        CommandPool::create(fake.clone(), &GRAPHICS).unwrap()
    }

    fn render_pass_begin() -> RenderPassBegin<'static> {
        RenderPassBegin {
            render_pass: vk::RenderPass::from_raw(0x1000),
            framebuffer: vk::Framebuffer::from_raw(0x2000),
            render_area: vk::Rect2D::default(),
            clear_values: &[],
        }
    }

    struct Fixtures {
        src: Buffer,
        dst: Buffer,
        mesh: Mesh,
    }

    impl Fixtures {
        fn new(fake: &Arc<FakeDevice>) -> Self {
            let mut src = Buffer::new(fake.clone());
            src.set_size(64).unwrap();
            src.init().unwrap();
            let mut dst = Buffer::new(fake.clone());
            dst.set_size(64).unwrap();
            dst.init().unwrap();
            let mut vertices = Buffer::new(fake.clone());
            vertices.set_size(36).unwrap();
            vertices
                .set_usage(vk::BufferUsageFlags::VERTEX_BUFFER)
                .unwrap();
            vertices.init().unwrap();
            let mut mesh = Mesh::new(0);
            mesh.add_vertices(&[glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Y]);
            mesh.set_vertex_buffer(vertices);
            Self { src, dst, mesh }
        }
    }

    type Op = fn(&mut CommandBuffer, &Fixtures) -> Result<()>;

    const OPERATIONS: &[(&str, Op)] = &[
        ("begin_recording", |cb, _| {
            cb.begin_recording(vk::CommandBufferUsageFlags::empty())
        }),
        ("pipeline_barrier", |cb, _| {
            cb.pipeline_barrier(&PipelineBarrier::new(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ))
        }),
        ("copy_buffer", |cb, f| cb.copy_buffer(&f.dst, &f.src)),
        ("begin_render_pass", |cb, _| {
            cb.begin_render_pass(&render_pass_begin())
        }),
        ("bind_pipeline", |cb, _| {
            cb.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, vk::Pipeline::null())
        }),
        ("set_viewport", |cb, _| {
            cb.set_viewport(&[vk::Viewport::default()])
        }),
        ("set_scissor", |cb, _| cb.set_scissor(&[vk::Rect2D::default()])),
        ("bind_vertex_buffers", |cb, f| {
            cb.bind_vertex_buffers(&[&f.mesh])
        }),
        ("draw", |cb, f| cb.draw(&f.mesh, 1)),
        ("bind_descriptor_set", |cb, _| {
            cb.bind_descriptor_set(
                vk::PipelineBindPoint::GRAPHICS,
                vk::PipelineLayout::null(),
                0,
                &[],
            )
        }),
        ("push_constants", |cb, _| {
            cb.push_constants(
                vk::PipelineLayout::null(),
                vk::ShaderStageFlags::VERTEX,
                0,
                &[0; 4],
            )
        }),
        ("end_render_pass", |cb, _| cb.end_render_pass()),
        ("end_recording", |cb, _| cb.end_recording()),
        ("submit", |cb, _| cb.submit(&GRAPHICS, &[], &[], None)),
        ("reset", |cb, _| cb.reset()),
    ];

    fn legal(operation: &str, state: RecordingState) -> Option<RecordingState> {
        use RecordingState::{Ended, Idle, InRenderPass, Recording, Submitted};
        match (operation, state) {
            ("begin_recording", Idle) => Some(Recording),
            ("pipeline_barrier" | "copy_buffer", Recording) => Some(Recording),
            ("begin_render_pass", Recording) => Some(InRenderPass),
            (
                "bind_pipeline" | "set_viewport" | "set_scissor" | "bind_vertex_buffers" | "draw",
                InRenderPass,
            ) => Some(InRenderPass),
            ("bind_descriptor_set" | "push_constants", Recording | InRenderPass) => Some(state),
            ("end_render_pass", InRenderPass) => Some(Recording),
            ("end_recording", Recording) => Some(Ended),
            ("submit", Ended) => Some(Submitted),
            ("reset", Idle | Ended | Submitted) => Some(Idle),
            _ => None,
        }
    }

    fn drive_to(cb: &mut CommandBuffer, state: RecordingState) {
        let path: &[RecordingState] = match state {
            RecordingState::Idle => &[],
            RecordingState::Recording => &[RecordingState::Recording],
            RecordingState::InRenderPass => {
                &[RecordingState::Recording, RecordingState::InRenderPass]
            }
            RecordingState::Ended => &[RecordingState::Recording, RecordingState::Ended],
            RecordingState::Submitted => &[
                RecordingState::Recording,
                RecordingState::Ended,
                RecordingState::Submitted,
            ],
        };
        for step in path {
            match step {
                RecordingState::Recording => cb
                    .begin_recording(vk::CommandBufferUsageFlags::empty())
                    .unwrap(),
                RecordingState::InRenderPass => {
                    cb.begin_render_pass(&render_pass_begin()).unwrap();
                }
                RecordingState::Ended => cb.end_recording().unwrap(),
                RecordingState::Submitted => cb.submit(&GRAPHICS, &[], &[], None).unwrap(),
                RecordingState::Idle => {}
            }
        }
        assert_eq!(cb.state(), state);
    }

    #[test]
    fn every_state_operation_pair() {
        use RecordingState::{Ended, Idle, InRenderPass, Recording, Submitted};
        let fake = FakeDevice::new();
        let fixtures = Fixtures::new(&fake);
        let mut pool = pool(&fake);

        for state in [Idle, Recording, InRenderPass, Ended, Submitted] {
            for (name, op) in OPERATIONS {
                let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
                let cb = pool.buffer_mut(&id).unwrap();
                drive_to(cb, state);

                let result = op(cb, &fixtures);
                match legal(name, state) {
                    Some(next) => {
                        assert!(result.is_ok(), "{name} in {state:?}: {result:?}");
                        assert_eq!(cb.state(), next, "{name} in {state:?}");
                    }
                    None => {
                        assert!(
                            matches!(
                                result,
                                Err(GpuError::InvalidCommandState { state: s, .. }) if s == state
                            ),
                            "{name} in {state:?} should be rejected, got {result:?}"
                        );
                        assert_eq!(cb.state(), state, "{name} changed state");
                    }
                }
                pool.free_buffer(id).unwrap();
            }
        }
    }

    #[test]
    fn native_failure_leaves_state_unchanged() {
        let fake = FakeDevice::new();
        let mut pool = pool(&fake);
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cb = pool.buffer_mut(&id).unwrap();

        fake.fail_next("begin_command_buffer", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(cb
            .begin_recording(vk::CommandBufferUsageFlags::empty())
            .is_err());
        assert_eq!(cb.state(), RecordingState::Idle);

        drive_to(cb, RecordingState::Ended);
        fake.fail_next("queue_submit", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(
            cb.submit(&GRAPHICS, &[], &[], None),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(cb.state(), RecordingState::Ended);
    }

    #[test]
    fn barriers_cover_whole_resources() {
        let fake = FakeDevice::new();
        let mut pool = pool(&fake);
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cb = pool.buffer_mut(&id).unwrap();
        drive_to(cb, RecordingState::Recording);

        let buffer = vk::Buffer::from_raw(0x10);
        let image = vk::Image::from_raw(0x20);
        cb.pipeline_barrier(
            &PipelineBarrier::new(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            )
            .global(GlobalBarrier {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
            })
            .buffer(BufferBarrier::new(
                buffer,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            ))
            .image(
                ImageBarrier::new(
                    image,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_READ,
                )
                .layouts(
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
            ),
        )
        .unwrap();

        let recorded = fake.barriers(cb.handle());
        assert_eq!(recorded.len(), 1);
        let barrier = &recorded[0];
        assert_eq!(barrier.memory.len(), 1);
        assert_eq!(barrier.buffers[0].size, vk::WHOLE_SIZE);
        assert_eq!(barrier.buffers[0].src_queue_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.images[0].level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(barrier.images[0].layer_count, vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(
            barrier.images[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn ownership_transfer_only_across_families() {
        let fake = FakeDevice::new();
        let mut pool = pool(&fake);
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cb = pool.buffer_mut(&id).unwrap();
        drive_to(cb, RecordingState::Recording);

        let image = vk::Image::from_raw(0x20);
        let layouts = (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        let same_family = QueueTransfer {
            from: GRAPHICS,
            to: Queue::new(vk::Queue::from_raw(0x99), GRAPHICS.family_index),
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ,
        };
        assert!(!cb
            .transfer_image_ownership(image, vk::ImageAspectFlags::COLOR, layouts, &same_family)
            .unwrap());
        assert!(!cb
            .transfer_buffer_ownership(vk::Buffer::from_raw(0x10), &same_family)
            .unwrap());
        assert!(fake.barriers(cb.handle()).is_empty());

        let cross_family = QueueTransfer {
            to: PRESENT,
            ..same_family
        };
        assert!(cb
            .transfer_image_ownership(image, vk::ImageAspectFlags::COLOR, layouts, &cross_family)
            .unwrap());
        assert!(cb
            .transfer_buffer_ownership(vk::Buffer::from_raw(0x10), &cross_family)
            .unwrap());

        let recorded = fake.barriers(cb.handle());
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].images[0].src_queue_family, 0);
        assert_eq!(recorded[0].images[0].dst_queue_family, 1);
        assert_eq!(recorded[1].buffers[0].dst_queue_family, 1);
    }

    #[test]
    fn copy_uses_source_size_and_rejects_small_destination() {
        let fake = FakeDevice::new();
        let fixtures = Fixtures::new(&fake);
        let mut small = Buffer::new(fake.clone());
        small.set_size(16).unwrap();
        small.init().unwrap();

        let mut pool = pool(&fake);
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cb = pool.buffer_mut(&id).unwrap();
        drive_to(cb, RecordingState::Recording);

        assert!(cb.copy_buffer(&small, &fixtures.src).is_err());
        cb.copy_buffer(&fixtures.dst, &small).unwrap();

        let commands = fake.commands(cb.handle());
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            FakeCommand::CopyBuffer { src, dst, regions } => {
                assert_eq!(*src, small.handle());
                assert_eq!(*dst, fixtures.dst.handle());
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].size, 16);
                assert_eq!(regions[0].dst_offset, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn vertex_bindings_must_be_contiguous() {
        let fake = FakeDevice::new();
        let fixtures = Fixtures::new(&fake);
        let mesh_at = |binding| {
            let mut buffer = Buffer::new(fake.clone());
            buffer.set_size(12).unwrap();
            buffer.init().unwrap();
            let mut mesh = Mesh::new(binding);
            mesh.add_vertices(&[glam::Vec3::ONE]);
            mesh.set_vertex_buffer(buffer);
            mesh
        };
        let (one, two, four) = (mesh_at(1), mesh_at(2), mesh_at(4));

        let mut pool = pool(&fake);
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cb = pool.buffer_mut(&id).unwrap();
        drive_to(cb, RecordingState::InRenderPass);

        assert!(matches!(
            cb.bind_vertex_buffers(&[]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            cb.bind_vertex_buffers(&[&one, &two, &four]),
            Err(GpuError::NonContiguousBindings {
                previous: 2,
                found: 4
            })
        ));
        assert!(matches!(
            cb.bind_vertex_buffers(&[&two, &one]),
            Err(GpuError::NonContiguousBindings { .. })
        ));
        cb.bind_vertex_buffers(&[&fixtures.mesh, &one, &two]).unwrap();
        cb.draw(&fixtures.mesh, 2).unwrap();

        let commands = fake.commands(cb.handle());
        assert!(matches!(
            &commands[commands.len() - 2],
            FakeCommand::BindVertexBuffers { first_binding: 0, buffers, .. } if buffers.len() == 3
        ));
        assert!(matches!(
            commands[commands.len() - 1],
            FakeCommand::Draw {
                vertex_count: 3,
                instance_count: 2
            }
        ));
    }

    #[test]
    fn pool_allocates_and_frees() {
        let fake = FakeDevice::new();
        let mut pool = pool(&fake);

        let ids = pool
            .allocate(vk::CommandBufferLevel::SECONDARY, 3)
            .unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(fake.live_count("command_buffer"), 3);
        assert!(ids.iter().all(|id| pool.buffer(id).unwrap().level()
            == vk::CommandBufferLevel::SECONDARY));

        let mut ids = ids.into_iter();
        let first = ids.next().unwrap();
        pool.free_buffer(first).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(fake.destroy_count("command_buffer"), 1);

        assert!(matches!(
            pool.allocate(vk::CommandBufferLevel::PRIMARY, 0),
            Err(GpuError::InvalidState(_))
        ));

        pool.finalize();
        pool.finalize();
        drop(pool);
        assert_eq!(fake.destroy_count("command_buffer"), 3);
        assert_eq!(fake.destroy_count("command_pool"), 1);
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn pool_rejects_foreign_ids() {
        let fake = FakeDevice::new();
        let mut ours = pool(&fake);
        let mut theirs = pool(&fake);
        let foreign = theirs.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();

        assert!(matches!(
            ours.buffer(&foreign),
            Err(GpuError::UnknownCommandBuffer)
        ));
        assert!(matches!(
            ours.free_buffer(foreign),
            Err(GpuError::UnknownCommandBuffer)
        ));
        assert_eq!(theirs.len(), 1);
        assert_eq!(fake.destroy_count("command_buffer"), 0);
    }

    #[test]
    fn pool_flags_frozen_after_init() {
        let fake = FakeDevice::new();
        let mut pool = pool(&fake);
        assert_eq!(
            pool.set_flags(vk::CommandPoolCreateFlags::TRANSIENT),
            Err(Rejected::AlreadyInitialized("command pool flags"))
        );
    }

    #[test]
    fn reset_requires_a_resettable_pool() {
        let fake = FakeDevice::new();
        let mut transient = CommandPool::new(fake.clone(), GRAPHICS.family_index);
        transient
            .set_flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .unwrap();
        transient.init().unwrap();
        let id = transient
            .allocate_one(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let cmd = transient.buffer_mut(&id).unwrap();
        assert!(!cmd.is_resettable());

        cmd.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        cmd.end_recording().unwrap();
        assert!(matches!(cmd.reset(), Err(GpuError::InvalidState(_))));
        assert_eq!(cmd.state(), RecordingState::Ended);

        let mut default_pool = pool(&fake);
        let id = default_pool
            .allocate_one(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let cmd = default_pool.buffer_mut(&id).unwrap();
        assert!(cmd.is_resettable());
        cmd.reset().unwrap();
    }
}
