//! Per-frame context for rendering, and the loop that drives it.

use ash::vk;
use dk_gpu::{
    CommandBuffer, CommandPool, DeviceRef, FrameRing, Framebuffer, GpuError, Queue, QueueTransfer,
    RenderPass, Swapchain,
};
use tracing::debug;

/// Context for the current frame being rendered.
///
/// The command buffer is recording when the application receives it and is
/// ended by the framework afterwards.
pub struct FrameContext<'a> {
    /// Command buffer for recording rendering commands.
    pub cmd: &'a mut CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Frame slot this frame uses.
    pub slot: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
    framebuffer: &'a Framebuffer,
    has_depth: bool,
}

impl FrameContext<'_> {
    /// Size of the image being rendered to.
    pub const fn extent(&self) -> vk::Extent2D {
        self.framebuffer.extent()
    }

    /// Begin the presentation render pass over the whole image.
    ///
    /// The colour attachment is cleared to `clear_color` and depth, when the
    /// pass has one, to 1.0.
    pub fn begin_render_pass(&mut self, clear_color: [f32; 4]) -> dk_gpu::Result<()> {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let count = if self.has_depth { 2 } else { 1 };
        self.cmd
            .begin_render_pass(&self.framebuffer.begin_info(&clear_values[..count]))
    }

    pub fn end_render_pass(&mut self) -> dk_gpu::Result<()> {
        self.cmd.end_render_pass()
    }
}

/// What happened to a frame handed to [`FrameLoop::draw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameStatus {
    /// Rendered and queued for presentation.
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Nothing was rendered; the swapchain must be recreated first.
    OutOfDate,
}

impl FrameStatus {
    pub(crate) const fn needs_resize(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Hands the acquired image from the presenting family to the graphics family.
const fn acquire_transfer(graphics: Queue, present: Queue) -> QueueTransfer {
    QueueTransfer {
        from: present,
        to: graphics,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access: vk::AccessFlags::empty(),
        dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    }
}

/// Hands the rendered image back for presentation.
const fn release_transfer(graphics: Queue, present: Queue) -> QueueTransfer {
    QueueTransfer {
        from: graphics,
        to: present,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_access: vk::AccessFlags::empty(),
    }
}

/// Frame slots and the command buffers they record into.
///
/// Frames are submitted on the graphics queue and presented on the present
/// queue. When the two belong to different families every frame moves its
/// swapchain image to the graphics family before recording and back after.
pub(crate) struct FrameLoop {
    pool: CommandPool,
    ring: FrameRing,
    graphics: Queue,
    present: Queue,
    has_depth: bool,
}

impl FrameLoop {
    pub(crate) fn create(
        device: &DeviceRef,
        graphics: Queue,
        present: Queue,
        frames_in_flight: usize,
        extent: vk::Extent2D,
        depth_format: Option<vk::Format>,
    ) -> dk_gpu::Result<Self> {
        let mut ring = FrameRing::create(device, frames_in_flight, extent, depth_format)?;
        let mut pool = CommandPool::create(device.clone(), &graphics)?;
        pool.allocate_for_frames(ring.as_mut_slice())?;
        Ok(Self {
            pool,
            ring,
            graphics,
            present,
            has_depth: depth_format.is_some(),
        })
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.ring.len()
    }

    /// Render one frame with `record` into the current slot and present it.
    ///
    /// An out-of-date swapchain is reported as a status, not an error; any
    /// other failure (including a timed-out fence or acquire) is returned.
    pub(crate) fn draw<F>(
        &mut self,
        swapchain: &Swapchain,
        render_pass: &RenderPass,
        frame_number: u64,
        dt: f32,
        record: F,
    ) -> anyhow::Result<FrameStatus>
    where
        F: FnOnce(&mut FrameContext<'_>) -> anyhow::Result<()>,
    {
        let slot = self.ring.index();
        let frame = self.ring.current_mut();
        let image_index = match frame.reset(swapchain, render_pass) {
            Ok(index) => index,
            Err(e) if e.is_out_of_date() => {
                debug!("Swapchain out of date on acquire");
                return Ok(FrameStatus::OutOfDate);
            }
            Err(e) => return Err(e.into()),
        };

        let id = frame
            .command_buffer()
            .ok_or(GpuError::UnknownCommandBuffer)?;
        let cmd = self.pool.buffer_mut(id)?;
        cmd.reset()?;
        let image = swapchain.image(image_index).ok_or_else(|| {
            GpuError::InvalidState(format!("swapchain has no image {image_index}"))
        })?;
        cmd.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.transfer_image_ownership(
            image,
            vk::ImageAspectFlags::COLOR,
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            &acquire_transfer(self.graphics, self.present),
        )?;
        {
            let mut frame_ctx = FrameContext {
                cmd: &mut *cmd,
                image_index,
                slot,
                dt,
                frame_number,
                framebuffer: frame.framebuffer(),
                has_depth: self.has_depth,
            };
            record(&mut frame_ctx)?;
        }
        cmd.transfer_image_ownership(
            image,
            vk::ImageAspectFlags::COLOR,
            (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            &release_transfer(self.graphics, self.present),
        )?;
        cmd.end_recording()?;
        frame.submit(cmd, &self.graphics)?;

        let suboptimal = match frame.present(swapchain, &self.present) {
            Ok(suboptimal) => suboptimal || frame.framebuffer().suboptimal(),
            Err(e) if e.is_out_of_date() => true,
            Err(e) => return Err(e.into()),
        };
        self.ring.advance();

        Ok(if suboptimal {
            FrameStatus::Suboptimal
        } else {
            FrameStatus::Presented
        })
    }

    /// Rebuild the size-dependent attachments of every slot.
    pub(crate) fn resize(&mut self, extent: vk::Extent2D) -> dk_gpu::Result<()> {
        self.ring.resize(extent)
    }

    /// Free every command buffer and frame slot. The device must be idle.
    pub(crate) fn finalize(&mut self) {
        for frame in self.ring.iter_mut() {
            frame.finalize();
        }
        self.pool.finalize();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk::Handle;
    use dk_gpu::fake::{FakeCommand, FakeDevice, FakeSurface};
    use dk_gpu::{RecordingState, SwapchainConfig, DEFAULT_DEPTH_FORMAT};

    use super::*;

    struct Setup {
        fake: Arc<FakeDevice>,
        swapchain: Swapchain,
        pass: RenderPass,
        frames: FrameLoop,
    }

    const GRAPHICS: Queue = Queue::new(vk::Queue::null(), 0);

    fn setup(depth: Option<vk::Format>) -> Setup {
        setup_with_present(depth, GRAPHICS)
    }

    fn setup_with_present(depth: Option<vk::Format>, present: Queue) -> Setup {
        let fake = FakeDevice::new();
        let device: DeviceRef = fake.clone();
        let mut swapchain =
            Swapchain::new(device.clone(), FakeSurface::new(), SwapchainConfig::default());
        swapchain.init().unwrap();
        let pass = RenderPass::for_presentation(device.clone(), swapchain.format(), depth).unwrap();
        let frames =
            FrameLoop::create(&device, GRAPHICS, present, 2, swapchain.extent(), depth).unwrap();
        Setup {
            fake,
            swapchain,
            pass,
            frames,
        }
    }

    impl Setup {
        fn draw(&mut self, frame_number: u64) -> anyhow::Result<FrameStatus> {
            self.frames.draw(
                &self.swapchain,
                &self.pass,
                frame_number,
                0.016,
                |frame| {
                    frame.begin_render_pass([0.2, 0.3, 0.4, 1.0])?;
                    frame.end_render_pass()?;
                    Ok(())
                },
            )
        }
    }

    #[test]
    fn draw_records_submits_and_presents() {
        let mut s = setup(Some(DEFAULT_DEPTH_FORMAT));
        assert_eq!(s.draw(0).unwrap(), FrameStatus::Presented);

        let submissions = s.fake.submissions();
        assert_eq!(submissions.len(), 1);
        let cmd = submissions[0].command_buffers[0];
        let commands = s.fake.commands(cmd);
        assert!(matches!(
            commands.first(),
            Some(FakeCommand::BeginRenderPass {
                clear_value_count: 2,
                ..
            })
        ));
        assert!(matches!(commands.last(), Some(FakeCommand::EndRenderPass)));

        let presents = s.fake.presents();
        assert_eq!(presents.len(), 1);
        assert_eq!(presents[0].image_index, 0);
        assert_eq!(
            presents[0].wait_semaphores,
            submissions[0].signal_semaphores
        );
    }

    #[test]
    fn shared_family_records_no_ownership_transfer() {
        let mut s = setup(None);
        s.draw(0).unwrap();
        let cmd = s.fake.submissions()[0].command_buffers[0];
        assert!(s.fake.barriers(cmd).is_empty());
        assert_eq!(s.fake.presents()[0].queue, GRAPHICS.handle);
    }

    #[test]
    fn separate_present_family_moves_the_image_each_frame() {
        let present = Queue::new(vk::Queue::from_raw(0x77), 1);
        let mut s = setup_with_present(None, present);
        s.draw(0).unwrap();

        let submission = &s.fake.submissions()[0];
        assert_eq!(submission.queue, GRAPHICS.handle);
        let presents = s.fake.presents();
        assert_eq!(presents[0].queue, present.handle);

        let image = s.swapchain.image(presents[0].image_index).unwrap();
        let commands = s.fake.commands(submission.command_buffers[0]);
        let barriers = s.fake.barriers(submission.command_buffers[0]);
        assert_eq!(barriers.len(), 2);
        assert!(matches!(commands.first(), Some(FakeCommand::Barrier(_))));
        assert!(matches!(commands.last(), Some(FakeCommand::Barrier(_))));

        let acquire = &barriers[0].images[0];
        assert_eq!(acquire.image, image);
        assert_eq!((acquire.src_queue_family, acquire.dst_queue_family), (1, 0));
        assert_eq!(acquire.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(acquire.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let release = &barriers[1].images[0];
        assert_eq!(release.image, image);
        assert_eq!((release.src_queue_family, release.dst_queue_family), (0, 1));
        assert_eq!(release.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barriers[1].dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn colour_only_pass_clears_one_attachment() {
        let mut s = setup(None);
        s.draw(0).unwrap();
        let cmd = s.fake.submissions()[0].command_buffers[0];
        assert!(matches!(
            s.fake.commands(cmd).first(),
            Some(FakeCommand::BeginRenderPass {
                clear_value_count: 1,
                ..
            })
        ));
    }

    #[test]
    fn frame_context_reports_slot_and_image() {
        let mut s = setup(None);
        let mut seen = Vec::new();
        for n in 0..3 {
            s.frames
                .draw(&s.swapchain, &s.pass, n, 0.0, |frame| {
                    assert_eq!(frame.cmd.state(), RecordingState::Recording);
                    assert_eq!(frame.extent(), s.swapchain.extent());
                    seen.push((frame.slot, frame.image_index, frame.frame_number));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(seen, vec![(0, 0, 0), (1, 1, 1), (0, 2, 2)]);
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let mut s = setup(None);
        s.fake
            .fail_next("acquire_next_image", vk::Result::ERROR_OUT_OF_DATE_KHR);
        let mut called = false;
        let status = s
            .frames
            .draw(&s.swapchain, &s.pass, 0, 0.0, |_| {
                called = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(status, FrameStatus::OutOfDate);
        assert!(status.needs_resize());
        assert!(!called);
        assert!(s.fake.submissions().is_empty());

        // The slot is still usable once the swapchain is rebuilt.
        s.swapchain.resize().unwrap();
        assert_eq!(s.draw(1).unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn out_of_date_present_asks_for_resize() {
        let mut s = setup(None);
        s.fake
            .fail_next("queue_present", vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(s.draw(0).unwrap(), FrameStatus::Suboptimal);
        assert_eq!(s.fake.submissions().len(), 1);
    }

    #[test]
    fn suboptimal_swapchain_asks_for_resize() {
        let mut s = setup(None);
        s.fake.set_suboptimal(true);
        let status = s.draw(0).unwrap();
        assert_eq!(status, FrameStatus::Suboptimal);
        assert!(status.needs_resize());
    }

    #[test]
    fn render_errors_are_returned() {
        let mut s = setup(None);
        let result = s
            .frames
            .draw(&s.swapchain, &s.pass, 0, 0.0, |_| {
                anyhow::bail!("shader missing")
            });
        assert!(result.is_err());
        assert!(s.fake.submissions().is_empty());
    }

    #[test]
    fn finalize_frees_everything() {
        let mut s = setup(Some(DEFAULT_DEPTH_FORMAT));
        s.draw(0).unwrap();
        s.frames.finalize();
        s.frames.finalize();
        assert_eq!(s.fake.live_count("command_pool"), 0);
        assert_eq!(s.fake.live_count("fence"), 0);
        assert_eq!(s.fake.invalid_destroys(), 0);
    }
}
