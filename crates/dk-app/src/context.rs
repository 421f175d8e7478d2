//! Application context.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use ash::vk;
use dk_gpu::{
    AshSurface, CommandBuffer, CommandBufferId, CommandPool, GpuContext, GpuContextBuilder,
    RecordingState, RenderPass, Swapchain, SwapchainConfig,
};
use tracing::info;
use winit::window::Window;

/// Application context shared across all app methods.
///
/// Gives access to the GPU context, window, swapchain and the render pass
/// frames are drawn with.
pub struct AppContext {
    /// GPU context with device and queue.
    pub gpu: GpuContext,
    /// Current swapchain.
    pub swapchain: Swapchain,
    /// Render pass the framework begins each frame with.
    pub render_pass: RenderPass,
    /// Depth format of the render pass, if it has a depth attachment.
    pub depth_format: Option<vk::Format>,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Whether vsync is enabled.
    pub vsync: bool,
    transfer_pool: CommandPool,
    transfer_cmd: Option<CommandBufferId>,
    pub(crate) last_frame_time: Instant,
    surface: Arc<AshSurface>,
    /// The window handle.
    pub window: Arc<Window>,
}

impl AppContext {
    /// Bring up the GPU for `window` and create the swapchain and render pass.
    pub(crate) fn new(
        window: Arc<Window>,
        builder: GpuContextBuilder,
        vsync: bool,
        depth_format: Option<vk::Format>,
    ) -> anyhow::Result<Self> {
        let extent = window_extent(&window);
        let (gpu, surface) = builder
            .build_for_window(window.as_ref(), extent)
            .context("Failed to create GPU context")?;

        let mut swapchain = Swapchain::new(
            gpu.device(),
            surface.clone(),
            SwapchainConfig::default().with_vsync(vsync),
        );
        swapchain.init().context("Failed to create swapchain")?;

        info!(
            "Swapchain created: {}x{} ({} images, {:?})",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.images().len(),
            swapchain.format()
        );

        let render_pass = RenderPass::for_presentation(gpu.device(), swapchain.format(), depth_format)
            .context("Failed to create render pass")?;
        let transfer_pool = CommandPool::create(gpu.device(), &gpu.graphics_queue())?;

        Ok(Self {
            gpu,
            swapchain,
            render_pass,
            depth_format,
            frame_count: 0,
            vsync,
            transfer_pool,
            transfer_cmd: None,
            last_frame_time: Instant::now(),
            surface,
            window,
        })
    }

    /// Get the current swapchain extent.
    pub const fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Get the aspect ratio (width / height).
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// An idle command buffer for uploads outside the frame loop.
    ///
    /// Uploads through [`dk_gpu::Buffer::push_data`] block until they have
    /// executed, so the buffer is reset here before it is handed out again.
    pub fn transfer_command_buffer(&mut self) -> anyhow::Result<&mut CommandBuffer> {
        let id = match self.transfer_cmd.take() {
            Some(id) => id,
            None => self
                .transfer_pool
                .allocate_one(vk::CommandBufferLevel::PRIMARY)?,
        };
        let id = self.transfer_cmd.insert(id);
        let cmd = self.transfer_pool.buffer_mut(id)?;
        if cmd.state() != RecordingState::Idle {
            cmd.reset()?;
        }
        Ok(cmd)
    }

    /// Rebuild the swapchain for the window's current size.
    ///
    /// Waits for the device to go idle first.
    pub(crate) fn recreate_swapchain(&mut self) -> anyhow::Result<vk::Extent2D> {
        self.surface.set_window_extent(window_extent(&self.window));
        self.swapchain
            .resize()
            .context("Failed to recreate swapchain")?;
        let extent = self.swapchain.extent();
        info!("Swapchain recreated: {}x{}", extent.width, extent.height);
        Ok(extent)
    }

    /// Destroy the context's GPU objects. The GPU must be idle.
    pub(crate) fn cleanup(&mut self) {
        self.transfer_cmd = None;
        self.transfer_pool.finalize();
        self.render_pass.finalize();
        self.swapchain.finalize();
    }
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width.max(1),
        height: size.height.max(1),
    }
}
