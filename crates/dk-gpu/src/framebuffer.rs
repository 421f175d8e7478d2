//! Per-frame framebuffers over swapchain images.

use ash::vk;
use tracing::error;

use crate::command::RenderPassBegin;
use crate::device::DeviceRef;
use crate::error::{GpuError, Result};
use crate::image_view::ImageView;
use crate::render_pass::RenderPass;
use crate::swapchain::{AcquiredImage, Swapchain};
use crate::sync::Semaphore;

/// A framebuffer bound to whichever swapchain image was acquired last.
///
/// Rebuilt every frame by [`Framebuffer::reset`].
pub struct Framebuffer {
    device: DeviceRef,
    framebuffer: vk::Framebuffer,
    render_pass: vk::RenderPass,
    image_index: u32,
    suboptimal: bool,
    extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            framebuffer: vk::Framebuffer::null(),
            render_pass: vk::RenderPass::null(),
            image_index: 0,
            suboptimal: false,
            extent: vk::Extent2D::default(),
        }
    }

    /// Acquire the next swapchain image and build a framebuffer around it.
    ///
    /// `image_acquired` is signalled once the image can be written. `depth`
    /// becomes attachment 1 when given. The previous framebuffer is destroyed
    /// first. Returns the acquired image index.
    pub fn reset(
        &mut self,
        swapchain: &Swapchain,
        render_pass: &RenderPass,
        image_acquired: &Semaphore,
        depth: Option<&ImageView>,
    ) -> Result<u32> {
        self.finalize();

        let AcquiredImage { index, suboptimal } = swapchain.acquire_next_image(image_acquired)?;
        let color = swapchain.view(index).ok_or_else(|| {
            GpuError::InvalidState(format!("swapchain has no image {index}"))
        })?;

        let mut attachments = vec![color.handle()];
        if let Some(depth) = depth {
            attachments.push(depth.handle());
        }
        let extent = swapchain.extent();

        self.framebuffer = self
            .device
            .create_framebuffer(render_pass.handle(), &attachments, extent)
            .map_err(|e| {
                error!("Failed to create framebuffer: {e}");
                GpuError::from(e)
            })?;
        self.render_pass = render_pass.handle();
        self.image_index = index;
        self.suboptimal = suboptimal;
        self.extent = extent;
        Ok(index)
    }

    /// Everything `begin_render_pass` needs to render into the whole framebuffer.
    pub fn begin_info<'a>(&self, clear_values: &'a [vk::ClearValue]) -> RenderPassBegin<'a> {
        RenderPassBegin {
            render_pass: self.render_pass,
            framebuffer: self.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent,
            },
            clear_values,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.framebuffer != vk::Framebuffer::null()
    }

    pub const fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Index of the swapchain image this framebuffer renders into.
    pub const fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Whether the acquire reported the swapchain as suboptimal.
    pub const fn suboptimal(&self) -> bool {
        self.suboptimal
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn finalize(&mut self) {
        if self.is_initialized() {
            self.device.destroy_framebuffer(self.framebuffer);
            self.framebuffer = vk::Framebuffer::null();
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeSurface};
    use crate::swapchain::SwapchainConfig;

    #[test]
    fn reset_targets_the_acquired_image() {
        let fake = FakeDevice::new();
        let mut swapchain =
            Swapchain::new(fake.clone(), FakeSurface::new(), SwapchainConfig::default());
        swapchain.init().unwrap();
        let pass = RenderPass::for_presentation(fake.clone(), swapchain.format(), None).unwrap();
        let semaphore = Semaphore::create(fake.clone()).unwrap();

        let mut framebuffer = Framebuffer::new(fake.clone());
        assert_eq!(framebuffer.reset(&swapchain, &pass, &semaphore, None).unwrap(), 0);
        let first = framebuffer.handle();
        assert_eq!(framebuffer.reset(&swapchain, &pass, &semaphore, None).unwrap(), 1);

        assert!(fake.framebuffer_info(first).is_none(), "old framebuffer destroyed");
        let (render_pass, attachments, extent) =
            fake.framebuffer_info(framebuffer.handle()).unwrap();
        assert_eq!(render_pass, pass.handle());
        assert_eq!(attachments, vec![swapchain.view(1).unwrap().handle()]);
        assert_eq!(extent, swapchain.extent());

        let clear = [vk::ClearValue::default()];
        let begin = framebuffer.begin_info(&clear);
        assert_eq!(begin.framebuffer, framebuffer.handle());
        assert_eq!(begin.render_area.extent, swapchain.extent());
    }

    #[test]
    fn failed_acquire_leaves_no_framebuffer() {
        let fake = FakeDevice::new();
        let mut swapchain =
            Swapchain::new(fake.clone(), FakeSurface::new(), SwapchainConfig::default());
        swapchain.init().unwrap();
        let pass = RenderPass::for_presentation(fake.clone(), swapchain.format(), None).unwrap();
        let semaphore = Semaphore::create(fake.clone()).unwrap();
        let mut framebuffer = Framebuffer::new(fake.clone());
        framebuffer.reset(&swapchain, &pass, &semaphore, None).unwrap();

        fake.fail_next("acquire_next_image", vk::Result::ERROR_OUT_OF_DATE_KHR);
        let err = framebuffer
            .reset(&swapchain, &pass, &semaphore, None)
            .unwrap_err();
        assert!(err.is_out_of_date());
        assert!(!framebuffer.is_initialized());
        assert_eq!(fake.live_count("framebuffer"), 0);
    }
}
