//! Window surfaces.
//!
//! [`AshSurface`] is the [`PresentSurface`] a [`crate::Swapchain`] presents to.
//! It answers capability queries from the driver and reports the window size
//! the application last told it about.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::AshDevice;
use crate::device::PresentSurface;
use crate::error::{GpuError, Result};

/// Create a raw surface for `window`.
///
/// # Safety
/// The instance must be valid and outlive the surface.
pub unsafe fn create_raw_surface<W>(
    entry: &ash::Entry,
    instance: &ash::Instance,
    window: &W,
) -> Result<vk::SurfaceKHR>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
    let window_handle = window
        .window_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

    ash_window::create_surface(
        entry,
        instance,
        display.as_raw(),
        window_handle.as_raw(),
        None,
    )
    .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
}

/// A window surface backed by the Vulkan driver.
pub struct AshSurface {
    device: Arc<AshDevice>,
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    window_extent: Mutex<vk::Extent2D>,
}

impl AshSurface {
    /// Take ownership of `surface`, created from `device`'s instance.
    pub(crate) fn new(
        device: Arc<AshDevice>,
        loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> Self {
        Self {
            device,
            loader,
            surface,
            window_extent: Mutex::new(window_extent),
        }
    }

    /// Record the window's new drawable size; called on resize.
    pub fn set_window_extent(&self, extent: vk::Extent2D) {
        *self.window_extent.lock() = extent;
    }
}

impl PresentSurface for AshSurface {
    fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.loader.get_physical_device_surface_capabilities(
                self.device.physical_device(),
                self.surface,
            )
        }?;
        Ok(caps)
    }

    fn formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(self.device.physical_device(), self.surface)
        }?;
        Ok(formats)
    }

    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader.get_physical_device_surface_present_modes(
                self.device.physical_device(),
                self.surface,
            )
        }?;
        Ok(modes)
    }

    fn window_extent(&self) -> vk::Extent2D {
        *self.window_extent.lock()
    }
}

impl Drop for AshSurface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
