//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dk_gpu::{GpuContextBuilder, DEFAULT_DEPTH_FORMAT};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::DkApp;
use crate::context::AppContext;
use crate::frame::{FrameLoop, FrameStatus};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Give the render pass a depth attachment.
    pub depth: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Dk".to_string(),
            width: 1280,
            height: 720,
            frames_in_flight: 3,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            depth: true,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of frames in flight (at least one).
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable the depth attachment.
    #[must_use]
    pub const fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a `DkApp` with the given configuration.
///
/// This function initializes logging, creates the window and GPU context,
/// and runs the event loop until the application exits. A frame that fails
/// ends the loop and the error is returned.
pub fn run_app<A: DkApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    // A second call (or a subscriber set by the caller) keeps the existing one
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: DkApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: DkApp> {
    app: A,
    frames: FrameLoop,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: DkApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    self.fail(event_loop, e);
                } else if state.app.should_exit() {
                    self.shutdown(event_loop);
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size) {
                    error!("Resize error: {e:#}");
                    self.fail(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: DkApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        // Create window
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let builder = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation);
        let depth_format = self.config.depth.then_some(DEFAULT_DEPTH_FORMAT);
        let mut ctx = AppContext::new(window, builder, self.config.vsync, depth_format)?;

        let frames = FrameLoop::create(
            &ctx.gpu.device(),
            ctx.gpu.graphics_queue(),
            ctx.gpu.present_queue(),
            self.config.frames_in_flight,
            ctx.extent(),
            depth_format,
        )?;
        info!("{} frames in flight", frames.slot_count());

        // Initialize the application
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            frames,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.failure.get_or_insert(e);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: DkApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        let Self {
            app, frames, ctx, ..
        } = self;
        let status = frames.draw(
            &ctx.swapchain,
            &ctx.render_pass,
            ctx.frame_count,
            dt,
            |frame| app.render(ctx, frame),
        )?;

        if status != FrameStatus::OutOfDate {
            self.ctx.frame_count += 1;
        }
        if status.needs_resize() {
            self.rebuild()?;
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        // Minimized; keep the old swapchain until the window has an area again
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        self.rebuild()
    }

    fn rebuild(&mut self) -> anyhow::Result<()> {
        let extent = self.ctx.recreate_swapchain()?;
        self.frames.resize(extent)?;
        self.app
            .on_resize(&mut self.ctx, extent.width, extent.height)?;
        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        // Print FPS statistics
        if self.ctx.frame_count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);

        // Then the frame slots and the context's own objects
        self.frames.finalize();
        self.ctx.cleanup();

        info!("Cleanup complete");
    }
}
