//! The native API seam.
//!
//! Every wrapper in this crate talks to the GPU through [`Device`], which
//! exposes exactly the raw Vulkan entry points the resource layer needs.
//! [`crate::backend::AshDevice`] forwards them to a real driver; the `fake`
//! feature provides an in-memory implementation for tests.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use crate::error::Result;

/// Shared handle to the device every wrapper was created from.
pub type DeviceRef = Arc<dyn Device>;

/// A device queue together with the family it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    /// Native queue handle.
    pub handle: vk::Queue,
    /// Queue family index.
    pub family_index: u32,
}

impl Queue {
    /// Wrap a queue handle.
    pub const fn new(handle: vk::Queue, family_index: u32) -> Self {
        Self {
            handle,
            family_index,
        }
    }

    /// Whether both queues belong to the same family.
    ///
    /// Resources never need an ownership transfer between queues of one family.
    pub const fn shares_family(&self, other: &Self) -> bool {
        self.family_index == other.family_index
    }
}

/// Semaphores and command buffers of one queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    /// Command buffers to execute, in order.
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores to wait on before the given stages run.
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage at which each wait semaphore is waited on.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signalled when the command buffers complete.
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Raw device operations used by the resource layer.
///
/// Handles passed in must have been created by the same implementation.
pub trait Device: Send + Sync {
    /// Memory types of the physical device, in driver order.
    fn memory_types(&self) -> Vec<vk::MemoryType>;

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map a range of host-visible memory; the pointer is valid until unmapped.
    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8>;
    fn flush_mapped_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<()>;
    fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<()>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until the fence signals; `Err(vk::Result::TIMEOUT)` on expiry.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, first: u32, viewports: &[vk::Viewport]);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, first: u32, scissors: &[vk::Rect2D]);
    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>)
        -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Returns the acquired index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<bool>;
}

/// The presentation collaborator: a window surface and what it supports.
pub trait PresentSurface: Send + Sync {
    /// Native surface handle.
    fn handle(&self) -> vk::SurfaceKHR;

    /// Current surface capabilities (re-queried on every call).
    fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR>;

    /// Supported surface formats.
    fn formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>>;

    /// Supported present modes.
    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>>;

    /// Size of the window's drawable area in pixels.
    fn window_extent(&self) -> vk::Extent2D;
}

/// Convert a timeout to the nanosecond count Vulkan expects.
pub(crate) fn timeout_ns(timeout: std::time::Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
