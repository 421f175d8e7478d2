//! Vulkan resource and frame-synchronization layer.
//!
//! This crate provides:
//! - a linear device memory arena shared by buffers and images
//! - buffer, image and image view wrappers with staged uploads
//! - command pools and command buffers that enforce the recording lifecycle
//! - fences, semaphores, render passes, swapchain and framebuffers
//! - frame resources for keeping several frames in flight
//!
//! Everything talks to the driver through the [`Device`] trait.
//! [`GpuContext`] brings up a real Vulkan device; with the `fake` feature,
//! [`fake::FakeDevice`] runs the same code without a GPU.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod image_view;
pub mod instance;
pub mod memory;
pub mod mesh;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use backend::AshDevice;
pub use buffer::{Backing, Buffer, UploadBarrier};
pub use command::{
    BufferBarrier, CommandBuffer, CommandBufferId, CommandPool, GlobalBarrier, ImageBarrier,
    PipelineBarrier, QueueTransfer, RecordingState, RenderPassBegin,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{Device, DeviceRef, PresentSurface, Queue, Submission};
pub use error::{GpuError, Rejected, Result, SetResult};
pub use frame::{FrameResources, FrameRing, DEFAULT_DEPTH_FORMAT};
pub use framebuffer::Framebuffer;
pub use image::Image;
pub use image_view::{ImageView, ViewTarget};
pub use instance::{pick_queue_families, QueueFamilies};
pub use memory::{find_memory_type, Binding, BoundResource, MemoryArena, SharedArena};
pub use mesh::{Mesh, VertexInput};
pub use render_pass::{
    basic_color_attachment, color_attachment, depth_attachment, RenderPass, Subpass,
};
pub use surface::AshSurface;
pub use swapchain::{AcquiredImage, Swapchain, SwapchainConfig, SwapchainImage};
pub use sync::{Fence, Semaphore, WaitSemaphore, DEFAULT_FENCE_TIMEOUT};
