//! Render passes.

use ash::vk;
use tracing::{debug, error};

use crate::device::DeviceRef;
use crate::error::{reject, GpuError, Rejected, Result, SetResult};

/// Attachments one subpass reads and writes.
#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub bind_point: vk::PipelineBindPoint,
    pub color: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

impl Subpass {
    /// A graphics subpass writing colour attachment 0 and, if given, a depth attachment.
    pub fn graphics(depth_attachment: Option<u32>) -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            color: vec![vk::AttachmentReference {
                attachment: 0,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }],
            depth: depth_attachment.map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
        }
    }
}

/// A colour attachment cleared on load and stored for presentation.
pub fn basic_color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    color_attachment(format, vk::ImageLayout::PRESENT_SRC_KHR)
}

/// A colour attachment cleared on load and stored for `final_layout`.
pub fn color_attachment(
    format: vk::Format,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(final_layout)
}

/// A depth attachment cleared on load and discarded afterwards.
pub fn depth_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
}

/// A render pass built from attachments, subpasses and dependencies added before `init`.
pub struct RenderPass {
    device: DeviceRef,
    render_pass: vk::RenderPass,
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<Subpass>,
    dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPass {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            render_pass: vk::RenderPass::null(),
            attachments: Vec::new(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// A single-subpass pass that renders into a presentable colour image.
    ///
    /// With `depth_format` a depth attachment is added at index 1.
    pub fn for_presentation(
        device: DeviceRef,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let mut pass = Self::new(device);
        pass.add_attachment(basic_color_attachment(color_format))?;
        if let Some(format) = depth_format {
            pass.add_attachment(depth_attachment(format))?;
        }
        pass.add_subpass(Subpass::graphics(depth_format.map(|_| 1)))?;

        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_format.is_some() {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        pass.add_dependency(
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(stages)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_stage_mask(stages)
                .dst_access_mask(access),
        )?;
        pass.init()?;
        Ok(pass)
    }

    pub fn add_attachment(&mut self, attachment: vk::AttachmentDescription) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("render pass attachments"));
        }
        self.attachments.push(attachment);
        Ok(())
    }

    pub fn add_subpass(&mut self, subpass: Subpass) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("render pass subpasses"));
        }
        self.subpasses.push(subpass);
        Ok(())
    }

    pub fn add_dependency(&mut self, dependency: vk::SubpassDependency) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("render pass dependencies"));
        }
        self.dependencies.push(dependency);
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        if self.subpasses.is_empty() {
            return Err(GpuError::InvalidState(
                "render pass needs at least one subpass".to_string(),
            ));
        }

        let subpasses: Vec<_> = self
            .subpasses
            .iter()
            .map(|subpass| {
                let description = vk::SubpassDescription::default()
                    .pipeline_bind_point(subpass.bind_point)
                    .color_attachments(&subpass.color);
                match &subpass.depth {
                    Some(depth) => description.depth_stencil_attachment(depth),
                    None => description,
                }
            })
            .collect();
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);

        self.render_pass = self.device.create_render_pass(&info).map_err(|e| {
            error!("Failed to create render pass: {e}");
            GpuError::from(e)
        })?;
        debug!(
            "Created render pass with {} attachments and {} subpasses",
            self.attachments.len(),
            self.subpasses.len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.render_pass != vk::RenderPass::null()
    }

    pub const fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn attachments(&self) -> &[vk::AttachmentDescription] {
        &self.attachments
    }

    pub fn finalize(&mut self) {
        if self.is_initialized() {
            self.device.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDevice;

    #[test]
    fn presentation_pass_with_depth() {
        let fake = FakeDevice::new();
        let pass = RenderPass::for_presentation(
            fake.clone(),
            vk::Format::B8G8R8A8_SRGB,
            Some(vk::Format::D16_UNORM),
        )
        .unwrap();

        assert!(pass.is_initialized());
        let attachments = pass.attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[1].format, vk::Format::D16_UNORM);
    }

    #[test]
    fn frozen_after_init() {
        let fake = FakeDevice::new();
        let mut pass =
            RenderPass::for_presentation(fake.clone(), vk::Format::B8G8R8A8_UNORM, None).unwrap();
        assert_eq!(
            pass.add_subpass(Subpass::graphics(None)),
            Err(Rejected::AlreadyInitialized("render pass subpasses"))
        );
        pass.finalize();
        pass.finalize();
        drop(pass);
        assert_eq!(fake.destroy_count("render_pass"), 1);
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn needs_a_subpass() {
        let fake = FakeDevice::new();
        let mut pass = RenderPass::new(fake.clone());
        assert!(pass.init().is_err());
        assert_eq!(fake.live_count("render_pass"), 0);
    }
}
