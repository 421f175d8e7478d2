//! GPU context management.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

use crate::backend::AshDevice;
use crate::device::{DeviceRef, Queue};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, find_queue_families, select_physical_device, QueueFamilies};
use crate::surface::{create_raw_surface, AshSurface};

/// A Vulkan device and its graphics, compute and present queues.
///
/// Queues of families that coincide are the same queue.
pub struct GpuContext {
    device: Arc<AshDevice>,
    graphics_queue: Queue,
    compute_queue: Queue,
    present_queue: Queue,
}

impl GpuContext {
    /// The device as the resource layer sees it.
    pub fn device(&self) -> DeviceRef {
        self.device.clone()
    }

    /// The concrete Vulkan device.
    pub const fn ash(&self) -> &Arc<AshDevice> {
        &self.device
    }

    /// Queue used for graphics and transfers.
    pub const fn graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    pub const fn compute_queue(&self) -> Queue {
        self.compute_queue
    }

    /// Queue swapchain images are presented on.
    ///
    /// Shares the graphics family whenever the device allows it. Headless
    /// contexts return the graphics queue.
    pub const fn present_queue(&self) -> Queue {
        self.present_queue
    }

    fn from_families(device: Arc<AshDevice>, families: QueueFamilies) -> Self {
        let queue = |family| {
            let handle = unsafe { device.raw().get_device_queue(family, 0) };
            Queue::new(handle, family)
        };
        Self {
            graphics_queue: queue(families.graphics),
            compute_queue: queue(families.compute),
            present_queue: queue(families.present),
            device,
        }
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.raw().device_wait_idle()?;
        }
        Ok(())
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Dk".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a context without presentation support.
    pub fn build(self) -> Result<GpuContext> {
        let entry = load_entry()?;
        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, &[]) }?;

        let picked = unsafe {
            select_physical_device(&instance, |device| {
                find_queue_families(&instance, device, |_| true).is_some()
            })
            .and_then(|physical_device| {
                let families = find_queue_families(&instance, physical_device, |_| true)
                    .ok_or(GpuError::NoSuitableDevice)?;
                let device = create_device(&instance, physical_device, &families, &[])?;
                Ok((physical_device, families, device))
            })
        };
        let (physical_device, mut families, device) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        // Nothing is presented without a surface.
        families.present = families.graphics;
        let device = Arc::new(unsafe { AshDevice::new(entry, instance, physical_device, device) });
        info!("Created headless GPU context ({families:?})");
        Ok(GpuContext::from_families(device, families))
    }

    /// Build a context that can present to `window`, plus the window's surface.
    ///
    /// `window_extent` is the window's current drawable size.
    pub fn build_for_window<W>(
        self,
        window: &W,
        window_extent: vk::Extent2D,
    ) -> Result<(GpuContext, Arc<AshSurface>)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = load_entry()?;
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let extensions = ash_window::enumerate_required_extensions(display.as_raw())?;
        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, extensions) }?;

        let loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = match unsafe { create_raw_surface(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let can_present = |device: vk::PhysicalDevice, family: u32| unsafe {
            loader
                .get_physical_device_surface_support(device, family, surface)
                .unwrap_or(false)
        };
        let picked = unsafe {
            select_physical_device(&instance, |device| {
                find_queue_families(&instance, device, |f| can_present(device, f)).is_some()
            })
            .and_then(|physical_device| {
                let families = find_queue_families(&instance, physical_device, |f| {
                    can_present(physical_device, f)
                })
                .ok_or(GpuError::NoSuitableDevice)?;
                let device = create_device(
                    &instance,
                    physical_device,
                    &families,
                    &[ash::khr::swapchain::NAME.as_ptr()],
                )?;
                Ok((physical_device, families, device))
            })
        };
        let (physical_device, families, device) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                unsafe {
                    loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let device = Arc::new(unsafe { AshDevice::new(entry, instance, physical_device, device) });
        let surface = Arc::new(AshSurface::new(device.clone(), loader, surface, window_extent));
        if families.graphics != families.present {
            info!("Presenting from a separate queue family; images change owner every frame");
        }
        info!("Created GPU context for window ({families:?})");
        Ok((GpuContext::from_families(device, families), surface))
    }
}

fn load_entry() -> Result<ash::Entry> {
    unsafe { ash::Entry::load() }
        .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))
}

/// Create the logical device with one queue of each distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    extensions: &[*const std::ffi::c_char],
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(extensions);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)
}
