//! Swapchain management.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, warn};

use crate::device::{timeout_ns, DeviceRef, PresentSurface, Queue};
use crate::error::{reject, GpuError, Rejected, Result, SetResult};
use crate::image_view::ImageView;
use crate::sync::Semaphore;

/// How long [`Swapchain::acquire_next_image`] waits for an image.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Requested presentation parameters.
///
/// On the first `init` unsupported values are replaced by supported ones
/// (see [`Swapchain::init`]), so after initialization this reflects what is
/// actually in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub create_flags: vk::SwapchainCreateFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    /// Images requested beyond the surface's minimum.
    pub image_surplus: u32,
    pub usage: vk::ImageUsageFlags,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            create_flags: vk::SwapchainCreateFlagsKHR::empty(),
            present_mode: vk::PresentModeKHR::MAILBOX,
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            image_surplus: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        }
    }
}

impl SwapchainConfig {
    /// FIFO when `vsync` is set, otherwise MAILBOX.
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.present_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        self
    }

    #[must_use]
    pub const fn with_surface_format(mut self, surface_format: vk::SurfaceFormatKHR) -> Self {
        self.surface_format = surface_format;
        self
    }

    #[must_use]
    pub const fn with_image_surplus(mut self, image_surplus: u32) -> Self {
        self.image_surplus = image_surplus;
        self
    }

    #[must_use]
    pub const fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

/// A presentable image and its view.
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: ImageView,
}

/// Result of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// The swapchain of one surface and the views of its images.
pub struct Swapchain {
    device: DeviceRef,
    surface: Arc<dyn PresentSurface>,
    swapchain: vk::SwapchainKHR,
    config: SwapchainConfig,
    image_count: u32,
    extent: vk::Extent2D,
    images: Vec<SwapchainImage>,
}

impl Swapchain {
    pub fn new(
        device: DeviceRef,
        surface: Arc<dyn PresentSurface>,
        config: SwapchainConfig,
    ) -> Self {
        Self {
            device,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            config,
            image_count: 0,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
        }
    }

    pub fn set_config(&mut self, config: SwapchainConfig) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("swapchain configuration"));
        }
        self.config = config;
        Ok(())
    }

    /// Create the swapchain.
    ///
    /// The first call checks the configuration against the surface:
    /// - an unsupported present mode falls back to FIFO;
    /// - the image count is the surface minimum plus the surplus, clamped to
    ///   the surface maximum when there is one;
    /// - unsupported usage flags are an error;
    /// - an unsupported transform falls back to the current one;
    /// - the surface format is the nearest available one.
    ///
    /// Calling it again on an initialized swapchain behaves like [`Self::resize`].
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            return self.resize();
        }
        self.validate_config()?;
        self.recreate()
    }

    fn validate_config(&mut self) -> Result<()> {
        let capabilities = self.surface.capabilities()?;

        let modes = self.surface.present_modes()?;
        let present_mode = select_present_mode(&modes, self.config.present_mode);
        if present_mode != self.config.present_mode {
            warn!(
                "Present mode {:?} not supported, falling back to {:?}",
                self.config.present_mode, present_mode
            );
            self.config.present_mode = present_mode;
        }

        self.image_count = image_count(&capabilities, self.config.image_surplus);

        if !capabilities
            .supported_usage_flags
            .contains(self.config.usage)
        {
            error!(
                "Swapchain usage {:?} not supported by the surface ({:?})",
                self.config.usage, capabilities.supported_usage_flags
            );
            return Err(GpuError::SwapchainCreation(format!(
                "usage {:?} not supported by the surface",
                self.config.usage
            )));
        }

        if !capabilities
            .supported_transforms
            .contains(self.config.transform)
        {
            warn!(
                "Transform {:?} not supported, using the current transform {:?}",
                self.config.transform, capabilities.current_transform
            );
            self.config.transform = capabilities.current_transform;
        }

        let formats = self.surface.formats()?;
        self.config.surface_format = nearest_surface_format(&formats, self.config.surface_format)
            .ok_or_else(|| {
                GpuError::SwapchainCreation("surface reports no formats".to_string())
            })?;
        Ok(())
    }

    fn recreate(&mut self) -> Result<()> {
        let capabilities = self.surface.capabilities()?;
        let extent = calculate_extent(&capabilities, self.surface.window_extent());
        let old_swapchain = self.swapchain;

        let info = vk::SwapchainCreateInfoKHR::default()
            .flags(self.config.create_flags)
            .surface(self.surface.handle())
            .min_image_count(self.image_count)
            .image_format(self.config.surface_format.format)
            .image_color_space(self.config.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(self.config.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(self.config.transform)
            .composite_alpha(self.config.composite_alpha)
            .present_mode(self.config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = self.device.create_swapchain(&info).map_err(|e| {
            error!("Failed to create swapchain: {e}");
            GpuError::SwapchainCreation(e.to_string())
        })?;

        // Views of the retired images go before the swapchain that owns them.
        self.images.clear();
        if old_swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(old_swapchain);
        }
        self.swapchain = swapchain;
        self.extent = extent;

        // The list stays empty unless every view was built.
        let format = self.config.surface_format.format;
        self.images = self
            .device
            .swapchain_images(swapchain)?
            .into_iter()
            .map(|image| -> Result<SwapchainImage> {
                let mut view = ImageView::new(self.device.clone());
                view.set_image_handle(image, format)?;
                view.init()?;
                Ok(SwapchainImage { image, view })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            self.config.surface_format.format,
            self.config.present_mode
        );
        Ok(())
    }

    /// Recreate the swapchain for the surface's current size.
    ///
    /// Waits for the device to go idle first; every image index and view
    /// handed out before is invalid afterwards.
    pub fn resize(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot resize an uninitialized swapchain".to_string(),
            ));
        }
        self.device.device_wait_idle()?;
        self.recreate()
    }

    /// Acquire the next image, waiting up to [`DEFAULT_ACQUIRE_TIMEOUT`].
    ///
    /// `semaphore` is signalled once the image can be written.
    pub fn acquire_next_image(&self, semaphore: &Semaphore) -> Result<AcquiredImage> {
        self.acquire_next_image_timeout(semaphore, DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn acquire_next_image_timeout(
        &self,
        semaphore: &Semaphore,
        timeout: Duration,
    ) -> Result<AcquiredImage> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot acquire from an uninitialized swapchain".to_string(),
            ));
        }
        match self
            .device
            .acquire_next_image(self.swapchain, timeout_ns(timeout), semaphore.handle())
        {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::Timeout {
                what: "swapchain image",
                timeout,
            }),
            // No image was acquired; the caller has to resize.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
            }
            Err(e) => {
                error!("Failed to acquire swapchain image: {e}");
                Err(e.into())
            }
        }
    }

    /// Queue image `index` for presentation once `wait_semaphores` signal.
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        queue: &Queue,
        wait_semaphores: &[vk::Semaphore],
        index: u32,
    ) -> Result<bool> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot present from an uninitialized swapchain".to_string(),
            ));
        }
        self.device
            .queue_present(queue.handle, wait_semaphores, self.swapchain, index)
            .map_err(GpuError::from)
    }

    pub fn is_initialized(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null()
    }

    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub const fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub const fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    /// Native handle of image `index`.
    pub fn image(&self, index: u32) -> Option<vk::Image> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.images.get(i))
            .map(|image| image.image)
    }

    /// View of image `index`.
    pub fn view(&self, index: u32) -> Option<&ImageView> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.images.get(i))
            .map(|image| &image.view)
    }

    pub fn surface(&self) -> &Arc<dyn PresentSurface> {
        &self.surface
    }

    /// Destroy the image views and the swapchain. Safe to repeat.
    pub fn finalize(&mut self) {
        self.images.clear();
        if self.is_initialized() {
            self.device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Pick the available format closest to `requested`.
///
/// An exact match wins, then the requested format in any colour space, then
/// the first available format. A single `UNDEFINED` entry means the surface
/// takes anything. Returns `None` if nothing is available.
pub fn nearest_surface_format(
    available: &[vk::SurfaceFormatKHR],
    requested: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return Some(requested);
        }
    }
    available
        .iter()
        .find(|f| f.format == requested.format && f.color_space == requested.color_space)
        .or_else(|| available.iter().find(|f| f.format == requested.format))
        .or_else(|| available.first())
        .copied()
}

/// `requested` if the surface supports it, otherwise FIFO (which every surface supports).
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Minimum image count plus `surplus`, clamped to the maximum if the surface has one.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR, surplus: u32) -> u32 {
    let count = capabilities.min_image_count.saturating_add(surplus);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Calculate swapchain extent.
///
/// The surface's current extent wins; `u32::MAX` means the swapchain decides,
/// in which case the window size is clamped to the supported range.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeSurface};

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    const fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn nearest_format_fallbacks() {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let hdr = vk::ColorSpaceKHR::HDR10_ST2084_EXT;
        let requested = format(vk::Format::B8G8R8A8_UNORM, srgb);

        let exact = [
            format(vk::Format::B8G8R8A8_UNORM, hdr),
            format(vk::Format::B8G8R8A8_UNORM, srgb),
        ];
        assert_eq!(nearest_surface_format(&exact, requested), Some(exact[1]));

        let same_format = [
            format(vk::Format::R8G8B8A8_UNORM, srgb),
            format(vk::Format::B8G8R8A8_UNORM, hdr),
        ];
        assert_eq!(
            nearest_surface_format(&same_format, requested),
            Some(same_format[1])
        );

        let unrelated = [
            format(vk::Format::R16G16B16A16_SFLOAT, hdr),
            format(vk::Format::R8G8B8A8_UNORM, srgb),
        ];
        assert_eq!(
            nearest_surface_format(&unrelated, requested),
            Some(unrelated[0])
        );

        let anything = [format(vk::Format::UNDEFINED, srgb)];
        assert_eq!(nearest_surface_format(&anything, requested), Some(requested));

        assert_eq!(nearest_surface_format(&[], requested), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(image_count(&caps, 1), 3);
        assert_eq!(image_count(&caps, 4), 3);
        caps.max_image_count = 0;
        assert_eq!(image_count(&caps, 4), 6, "zero maximum means unbounded");
    }

    #[test]
    fn extent_from_surface_or_clamped_window() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(640, 480),
            min_image_extent: extent(100, 100),
            max_image_extent: extent(1000, 1000),
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, extent(2000, 50)), extent(640, 480));

        caps.current_extent = extent(u32::MAX, u32::MAX);
        assert_eq!(calculate_extent(&caps, extent(2000, 50)), extent(1000, 100));
        assert_eq!(calculate_extent(&caps, extent(300, 400)), extent(300, 400));
    }

    #[test]
    fn init_applies_configuration() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();

        let info = fake.swapchain_info(swapchain.handle()).unwrap();
        assert_eq!(info.min_image_count, 3);
        assert_eq!(info.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(info.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(info.extent, extent(800, 600));
        assert_eq!(info.old_swapchain, vk::SwapchainKHR::null());

        assert_eq!(swapchain.images().len(), 3);
        for image in swapchain.images() {
            assert_eq!(
                fake.image_view_info(image.view.handle()),
                Some((image.image, vk::Format::B8G8R8A8_UNORM))
            );
        }
    }

    #[test]
    fn unsupported_settings_fall_back() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        surface.set_present_modes(vec![vk::PresentModeKHR::FIFO]);
        surface.set_formats(vec![format(
            vk::Format::R8G8B8A8_SRGB,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )]);
        surface.update_capabilities(|caps| {
            caps.max_image_count = 2;
            caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
            caps.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        });

        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();

        let config = swapchain.config();
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.surface_format.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(config.transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
        let info = fake.swapchain_info(swapchain.handle()).unwrap();
        assert_eq!(info.min_image_count, 2);
        assert_eq!(info.transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }

    #[test]
    fn unsupported_usage_is_an_error() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let config = SwapchainConfig::default().with_usage(vk::ImageUsageFlags::STORAGE);
        let mut swapchain = Swapchain::new(fake.clone(), surface, config);

        assert!(matches!(
            swapchain.init(),
            Err(GpuError::SwapchainCreation(_))
        ));
        assert_eq!(fake.live_count("swapchain"), 0);
    }

    #[test]
    fn resize_rebuilds_everything() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain =
            Swapchain::new(fake.clone(), surface.clone(), SwapchainConfig::default());
        swapchain.init().unwrap();
        let old = swapchain.handle();
        let old_images: Vec<_> = swapchain.images().iter().map(|i| i.image).collect();

        surface.resize(extent(1024, 768));
        swapchain.resize().unwrap();

        assert_eq!(fake.wait_idle_count(), 1);
        assert_ne!(swapchain.handle(), old);
        assert_eq!(swapchain.extent(), extent(1024, 768));
        let info = fake.swapchain_info(swapchain.handle()).unwrap();
        assert_eq!(info.old_swapchain, old);
        assert!(fake.swapchain_info(old).is_none(), "retired swapchain destroyed");

        assert_eq!(fake.destroy_count("image_view"), 3);
        assert_eq!(fake.live_count("image_view"), 3);
        assert!(swapchain
            .images()
            .iter()
            .all(|i| !old_images.contains(&i.image)));
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn second_init_waits_for_the_device() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();
        assert_eq!(fake.wait_idle_count(), 0);
        let old = swapchain.handle();

        swapchain.init().unwrap();
        assert_eq!(fake.wait_idle_count(), 1);
        assert_ne!(swapchain.handle(), old);
        assert_eq!(swapchain.images().len(), 3);
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn failed_rebuild_leaves_no_stale_images() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();

        fake.fail_next("create_image_view", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(swapchain.resize().is_err());
        assert!(swapchain.images().is_empty());
        assert_eq!(swapchain.image(0), None);
        assert_eq!(fake.live_count("image_view"), 0);

        swapchain.resize().unwrap();
        assert_eq!(swapchain.images().len(), 3);
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn acquire_and_present() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();
        let semaphore = Semaphore::create(fake.clone()).unwrap();

        let first = swapchain.acquire_next_image(&semaphore).unwrap();
        assert_eq!(first, AcquiredImage { index: 0, suboptimal: false });
        assert!(fake.is_semaphore_signaled(semaphore.handle()));

        fake.set_suboptimal(true);
        let second = swapchain.acquire_next_image(&semaphore).unwrap();
        assert_eq!(second.index, 1);
        assert!(second.suboptimal, "suboptimal still yields an image");

        let queue = Queue::new(vk::Queue::null(), 0);
        assert!(swapchain
            .present(&queue, &[semaphore.handle()], second.index)
            .unwrap());
        assert_eq!(fake.presents()[0].image_index, 1);

        fake.fail_next("acquire_next_image", vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(swapchain
            .acquire_next_image(&semaphore)
            .unwrap_err()
            .is_out_of_date());
        fake.fail_next("acquire_next_image", vk::Result::TIMEOUT);
        assert!(swapchain
            .acquire_next_image(&semaphore)
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn finalize_twice_destroys_once() {
        let fake = FakeDevice::new();
        let surface = FakeSurface::new();
        let mut swapchain = Swapchain::new(fake.clone(), surface, SwapchainConfig::default());
        swapchain.init().unwrap();
        swapchain.finalize();
        swapchain.finalize();
        drop(swapchain);
        assert_eq!(fake.destroy_count("swapchain"), 1);
        assert_eq!(fake.destroy_count("image_view"), 3);
        assert_eq!(fake.invalid_destroys(), 0);
    }
}
