//! `DkApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for applications driven by the dk frame loop.
///
/// The framework handles window creation, GPU initialization, swapchain
/// management and frame pacing; the application records commands.
pub trait DkApp: Sized {
    /// Initialize the application.
    ///
    /// Called once when the application starts, after the GPU context,
    /// swapchain and render pass have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Render a frame.
    ///
    /// Called every frame after `update()` with a command buffer that is
    /// already recording. The framework handles:
    /// - Waiting for the frame slot and acquiring a swapchain image
    /// - Ending and submitting the command buffer
    /// - Presenting to the screen
    ///
    /// An error ends the application.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the swapchain and depth attachments have been rebuilt.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Whether the application wants to quit after the current frame.
    fn should_exit(&self) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
