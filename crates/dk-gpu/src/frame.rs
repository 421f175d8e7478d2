//! Frame resources and frames-in-flight cycling.
//!
//! Each [`FrameResources`] slot owns everything one frame needs while the GPU
//! works on it: an image-acquired semaphore, a render-done semaphore, a
//! draw-done fence, a framebuffer and an optional depth attachment. A
//! [`FrameRing`] cycles through N slots so the CPU can record frame `i + 1`
//! while the GPU still renders frame `i`, blocking only when it comes back to
//! a slot whose previous frame has not finished.

use ash::vk;
use tracing::debug;

use crate::command::{CommandBuffer, CommandBufferId};
use crate::device::{DeviceRef, Queue};
use crate::error::{GpuError, Result};
use crate::framebuffer::Framebuffer;
use crate::image_view::ImageView;
use crate::render_pass::RenderPass;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, Semaphore};

/// Format used for depth attachments unless the caller picks another.
pub const DEFAULT_DEPTH_FORMAT: vk::Format = vk::Format::D16_UNORM;

/// Synchronization objects and attachments of one frame in flight.
pub struct FrameResources {
    device: DeviceRef,
    image_acquired: Semaphore,
    render_done: Semaphore,
    draw_done: Fence,
    framebuffer: Framebuffer,
    depth: Option<ImageView>,
    command_buffer: Option<CommandBufferId>,
}

impl FrameResources {
    /// Create a slot whose draw-done fence starts signalled, so the first
    /// [`Self::reset`] does not block.
    ///
    /// With `depth_format` a depth attachment of `extent` is created too.
    pub fn create(
        device: DeviceRef,
        extent: vk::Extent2D,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let depth = depth_format
            .map(|format| create_depth(&device, extent, format))
            .transpose()?;
        Ok(Self {
            image_acquired: Semaphore::create(device.clone())?,
            render_done: Semaphore::create(device.clone())?,
            draw_done: Fence::create(device.clone(), true)?,
            framebuffer: Framebuffer::new(device.clone()),
            depth,
            command_buffer: None,
            device,
        })
    }

    /// Prepare the slot for a new frame and return the swapchain image index.
    ///
    /// Waits for the slot's previous frame to finish, acquires the next
    /// swapchain image (signalling the image-acquired semaphore) into a fresh
    /// framebuffer, and resets the draw-done fence. A failed acquire leaves
    /// the fence signalled, so the slot can be reset again after a resize.
    pub fn reset(&mut self, swapchain: &Swapchain, render_pass: &RenderPass) -> Result<u32> {
        self.draw_done.wait()?;
        let index = self.framebuffer.reset(
            swapchain,
            render_pass,
            &self.image_acquired,
            self.depth.as_ref(),
        )?;
        self.draw_done.reset()?;
        Ok(index)
    }

    /// Recreate the depth attachment for a new swapchain extent.
    ///
    /// Semaphores, fence and framebuffer are unaffected.
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        if let Some(depth) = &mut self.depth {
            let format = depth.format();
            depth.finalize();
            *depth = create_depth(&self.device, extent, format)?;
            debug!("Resized depth attachment to {}x{}", extent.width, extent.height);
        }
        Ok(())
    }

    /// Submit `cmd` as this slot's frame.
    ///
    /// The submission waits for the image-acquired semaphore at colour
    /// attachment output, signals render-done and the draw-done fence.
    pub fn submit(&self, cmd: &mut CommandBuffer, queue: &Queue) -> Result<()> {
        cmd.submit(
            queue,
            &[self
                .image_acquired
                .at(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[self.render_done.handle()],
            Some(&self.draw_done),
        )
    }

    /// Present the acquired image once rendering is done.
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(&self, swapchain: &Swapchain, queue: &Queue) -> Result<bool> {
        if !self.framebuffer.is_initialized() {
            return Err(GpuError::InvalidState(
                "frame has no acquired image to present".to_string(),
            ));
        }
        swapchain.present(
            queue,
            &[self.render_done.handle()],
            self.framebuffer.image_index(),
        )
    }

    pub const fn image_acquired(&self) -> &Semaphore {
        &self.image_acquired
    }

    pub const fn render_done(&self) -> &Semaphore {
        &self.render_done
    }

    pub const fn draw_done(&self) -> &Fence {
        &self.draw_done
    }

    pub const fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub const fn depth(&self) -> Option<&ImageView> {
        self.depth.as_ref()
    }

    /// The command buffer recorded for this slot, if one was assigned.
    pub const fn command_buffer(&self) -> Option<&CommandBufferId> {
        self.command_buffer.as_ref()
    }

    pub fn set_command_buffer(&mut self, id: CommandBufferId) {
        self.command_buffer = Some(id);
    }

    pub fn take_command_buffer(&mut self) -> Option<CommandBufferId> {
        self.command_buffer.take()
    }

    /// Destroy every object of the slot. Safe to repeat.
    ///
    /// The command buffer id is dropped; its buffer stays with the pool.
    pub fn finalize(&mut self) {
        self.command_buffer = None;
        self.image_acquired.finalize();
        self.render_done.finalize();
        self.draw_done.finalize();
        self.framebuffer.finalize();
        if let Some(depth) = &mut self.depth {
            depth.finalize();
        }
    }
}

fn create_depth(
    device: &DeviceRef,
    extent: vk::Extent2D,
    format: vk::Format,
) -> Result<ImageView> {
    let mut view = ImageView::new(device.clone());
    view.set_format(format)?;
    view.set_aspect(vk::ImageAspectFlags::DEPTH)?;
    view.set_image_params(
        vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        None,
    )?;
    if let Some(image) = view.image_mut() {
        image.set_usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)?;
    }
    view.init()?;
    Ok(view)
}

/// N frame slots used round-robin.
pub struct FrameRing {
    frames: Vec<FrameResources>,
    current: usize,
}

impl FrameRing {
    /// Create `count` slots.
    pub fn create(
        device: &DeviceRef,
        count: usize,
        extent: vk::Extent2D,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let frames = (0..count)
            .map(|_| FrameResources::create(device.clone(), extent, depth_format))
            .collect::<Result<Vec<_>>>()?;
        Self::new(frames)
    }

    pub fn new(frames: Vec<FrameResources>) -> Result<Self> {
        if frames.is_empty() {
            return Err(GpuError::InvalidState(
                "frame ring needs at least one slot".to_string(),
            ));
        }
        debug!("Created frame ring with {} slots", frames.len());
        Ok(Self { frames, current: 0 })
    }

    pub fn current(&self) -> &FrameResources {
        &self.frames[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameResources {
        &mut self.frames[self.current]
    }

    /// Index of the current slot.
    pub const fn index(&self) -> usize {
        self.current
    }

    /// Move on to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FrameResources> {
        self.frames.iter_mut()
    }

    pub fn as_mut_slice(&mut self) -> &mut [FrameResources] {
        &mut self.frames
    }

    /// Recreate every slot's depth attachment.
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.frames.iter_mut().try_for_each(|frame| frame.resize(extent))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::command::CommandPool;
    use crate::fake::{FakeDevice, FakeSurface};
    use crate::swapchain::SwapchainConfig;

    struct Harness {
        fake: Arc<FakeDevice>,
        queue: Queue,
        swapchain: Swapchain,
        pass: RenderPass,
        pool: CommandPool,
        ring: FrameRing,
    }

    impl Harness {
        fn new(slots: usize) -> Self {
            let fake = FakeDevice::new();
            let device: DeviceRef = fake.clone();
            let queue = Queue::new(vk::Queue::null(), 0);
            let mut swapchain =
                Swapchain::new(device.clone(), FakeSurface::new(), SwapchainConfig::default());
            swapchain.init().unwrap();
            let pass = RenderPass::for_presentation(
                device.clone(),
                swapchain.format(),
                Some(DEFAULT_DEPTH_FORMAT),
            )
            .unwrap();
            let mut ring = FrameRing::create(
                &device,
                slots,
                swapchain.extent(),
                Some(DEFAULT_DEPTH_FORMAT),
            )
            .unwrap();
            let mut pool = CommandPool::create(device, &queue).unwrap();
            pool.allocate_for_frames(ring.as_mut_slice()).unwrap();
            Self {
                fake,
                queue,
                swapchain,
                pass,
                pool,
                ring,
            }
        }

        fn run_frame(&mut self) -> Result<u32> {
            let frame = self.ring.current_mut();
            let index = frame.reset(&self.swapchain, &self.pass)?;
            let id = frame
                .command_buffer()
                .ok_or(GpuError::UnknownCommandBuffer)?;
            let cmd = self.pool.buffer_mut(id)?;
            cmd.reset()?;
            cmd.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            let clear = [vk::ClearValue::default()];
            cmd.begin_render_pass(&frame.framebuffer().begin_info(&clear))?;
            cmd.end_render_pass()?;
            cmd.end_recording()?;
            frame.submit(cmd, &self.queue)?;
            frame.present(&self.swapchain, &self.queue)?;
            self.ring.advance();
            Ok(index)
        }
    }

    #[test]
    fn slots_cycle_and_wait_on_their_own_fence() {
        let mut h = Harness::new(3);
        h.fake.complete_submissions_after(Duration::from_millis(5));
        let fences: Vec<_> = h
            .ring
            .iter_mut()
            .map(|frame| frame.draw_done().handle())
            .collect();

        for k in 0..7 {
            assert_eq!(h.ring.index(), k % 3);
            h.fake.clear_fence_waits();
            h.run_frame().unwrap();
            assert_eq!(h.fake.fence_waits(), vec![fences[k % 3]]);
        }
        assert_eq!(h.ring.index(), 1);
        assert_eq!(h.fake.presents().len(), 7);
    }

    #[test]
    fn submission_waits_on_acquire_and_signals_render_done() {
        let mut h = Harness::new(2);
        let image_acquired = h.ring.current().image_acquired().handle();
        let render_done = h.ring.current().render_done().handle();
        let fence = h.ring.current().draw_done().handle();
        let index = h.run_frame().unwrap();

        let submission = &h.fake.submissions()[0];
        assert_eq!(submission.wait_semaphores, vec![image_acquired]);
        assert_eq!(
            submission.wait_stages,
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(submission.signal_semaphores, vec![render_done]);
        assert_eq!(submission.fence, fence);

        let present = &h.fake.presents()[0];
        assert_eq!(present.wait_semaphores, vec![render_done]);
        assert_eq!(present.image_index, index);
    }

    #[test]
    fn stuck_slot_times_out_without_touching_others() {
        let mut h = Harness::new(3);
        h.fake.complete_submissions_after(Duration::from_millis(5));
        h.run_frame().unwrap();
        h.fake.never_complete_submissions();
        h.run_frame().unwrap();
        h.fake.complete_submissions_after(Duration::from_millis(5));
        h.run_frame().unwrap();

        // Back at slot 0, whose frame completes.
        h.run_frame().unwrap();

        let stuck = h.ring.current().draw_done().handle();
        h.fake.clear_fence_waits();
        let err = h.run_frame().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(h.fake.fence_waits(), vec![stuck]);
    }

    #[test]
    fn reset_waits_then_acquires_then_resets_the_fence() {
        let mut h = Harness::new(1);
        let fence = h.ring.current().draw_done().handle();
        let acquired = h.ring.current().image_acquired().handle();

        // A failed wait stops before the acquire.
        h.fake.fail_next("wait_for_fence", vk::Result::ERROR_DEVICE_LOST);
        let frame = h.ring.current_mut();
        assert!(frame.reset(&h.swapchain, &h.pass).is_err());
        assert!(!h.fake.is_semaphore_signaled(acquired));
        assert!(h.fake.is_fence_signaled(fence));

        // An out-of-date acquire comes after the wait and leaves the fence signalled.
        h.fake.clear_fence_waits();
        h.fake
            .fail_next("acquire_next_image", vk::Result::ERROR_OUT_OF_DATE_KHR);
        let err = frame.reset(&h.swapchain, &h.pass).unwrap_err();
        assert!(err.is_out_of_date());
        assert_eq!(h.fake.fence_waits(), vec![fence]);
        assert!(h.fake.is_fence_signaled(fence));

        // So the slot can be reset again without timing out.
        h.fake.clear_fence_waits();
        frame.reset(&h.swapchain, &h.pass).unwrap();
        assert_eq!(h.fake.fence_waits(), vec![fence]);
        assert!(h.fake.is_semaphore_signaled(acquired));
        assert!(!h.fake.is_fence_signaled(fence));
    }

    #[test]
    fn resize_rebuilds_depth_only() {
        let mut h = Harness::new(2);
        let semaphores: Vec<_> = h
            .ring
            .iter_mut()
            .map(|frame| frame.image_acquired().handle())
            .collect();
        let new_extent = vk::Extent2D {
            width: 320,
            height: 200,
        };
        h.ring.resize(new_extent).unwrap();

        assert_eq!(h.fake.destroy_count("image_view"), 2);
        assert_eq!(h.fake.destroy_count("semaphore"), 0);
        assert_eq!(h.fake.destroy_count("fence"), 0);
        for (frame, semaphore) in h.ring.iter_mut().zip(semaphores) {
            assert_eq!(frame.image_acquired().handle(), semaphore);
            let depth = frame.depth().unwrap();
            assert_eq!(depth.format(), DEFAULT_DEPTH_FORMAT);
            let image = depth.image().unwrap();
            assert_eq!(image.extent().width, 320);
            assert_eq!(image.extent().height, 200);
            assert_eq!(
                image.usage(),
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            );
        }
    }

    #[test]
    fn empty_ring_is_an_error() {
        assert!(matches!(
            FrameRing::new(Vec::new()),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn finalize_twice_destroys_once() {
        let fake = FakeDevice::new();
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        let mut frame =
            FrameResources::create(fake.clone(), extent, Some(DEFAULT_DEPTH_FORMAT)).unwrap();
        frame.finalize();
        frame.finalize();
        drop(frame);
        assert_eq!(fake.destroy_count("semaphore"), 2);
        assert_eq!(fake.destroy_count("fence"), 1);
        assert_eq!(fake.destroy_count("image_view"), 1);
        assert_eq!(fake.destroy_count("image"), 1);
        assert_eq!(fake.invalid_destroys(), 0);
    }
}
