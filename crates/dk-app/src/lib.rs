//! Application framework for dk-gpu.
//!
//! This crate handles the boilerplate around the resource layer:
//! - Window creation and management
//! - GPU context and surface bring-up
//! - Swapchain creation and recreation on resize
//! - Keeping several frames in flight
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use dk_app::{run_app, AppConfig, AppContext, DkApp, FrameContext};
//!
//! struct MyApp;
//!
//! impl DkApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         frame.begin_render_pass([0.1, 0.1, 0.1, 1.0])?;
//!         frame.end_render_pass()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::DkApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use dk_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::WindowEvent;
