//! Image views.

use ash::vk;
use tracing::error;

use crate::device::DeviceRef;
use crate::error::{reject, GpuError, Rejected, Result, SetResult};
use crate::image::Image;
use crate::memory::SharedArena;

/// The image a view looks at.
pub enum ViewTarget {
    /// No image chosen yet.
    None,
    /// An image created for, and destroyed with, the view.
    Owned(Box<Image>),
    /// An [`Image`] owned elsewhere.
    Borrowed { image: vk::Image, format: vk::Format },
    /// A native image this crate does not manage, such as a swapchain image.
    Direct { image: vk::Image, format: vk::Format },
}

/// A view of an image.
///
/// Defaults to a 2D view of the colour aspect covering every mip level and
/// array layer, in `B8G8R8A8_UNORM`.
pub struct ImageView {
    device: DeviceRef,
    view: vk::ImageView,
    target: ViewTarget,
    view_type: vk::ImageViewType,
    format: vk::Format,
    components: vk::ComponentMapping,
    subresource_range: vk::ImageSubresourceRange,
}

impl ImageView {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            view: vk::ImageView::null(),
            target: ViewTarget::None,
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk::Format::B8G8R8A8_UNORM,
            components: vk::ComponentMapping::default(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
        }
    }

    fn check_unset(&self) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view target"));
        }
        if !matches!(self.target, ViewTarget::None) {
            return reject(Rejected::TargetAlreadySet);
        }
        Ok(())
    }

    /// Create the viewed image as part of this view, in the view's format.
    ///
    /// The image is initialized by [`Self::init`]; configure it further through
    /// [`Self::image_mut`]. With `memory` the image binds into that arena,
    /// otherwise it gets its own.
    pub fn set_image_params(
        &mut self,
        extent: vk::Extent3D,
        memory: Option<SharedArena>,
    ) -> SetResult {
        self.check_unset()?;
        let mut image = match memory {
            Some(arena) => Image::with_shared_memory(self.device.clone(), arena),
            None => Image::new(self.device.clone()),
        };
        image.set_format(self.format)?;
        image.set_extent(extent)?;
        self.target = ViewTarget::Owned(Box::new(image));
        Ok(())
    }

    /// View an [`Image`] that outlives this view.
    pub fn set_image(&mut self, image: &Image) -> SetResult {
        self.check_unset()?;
        self.format = image.format();
        self.target = ViewTarget::Borrowed {
            image: image.handle(),
            format: image.format(),
        };
        Ok(())
    }

    /// View a native image this crate does not manage.
    pub fn set_image_handle(&mut self, image: vk::Image, format: vk::Format) -> SetResult {
        self.check_unset()?;
        self.format = format;
        self.target = ViewTarget::Direct { image, format };
        Ok(())
    }

    pub fn set_view_type(&mut self, view_type: vk::ImageViewType) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view type"));
        }
        self.view_type = view_type;
        Ok(())
    }

    /// Format of the view; an owned image follows it.
    pub fn set_format(&mut self, format: vk::Format) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view format"));
        }
        match &mut self.target {
            ViewTarget::None => {}
            ViewTarget::Owned(image) => image.set_format(format)?,
            ViewTarget::Borrowed {
                format: image_format,
                ..
            } => {
                if *image_format != format {
                    return reject(Rejected::FormatMismatch {
                        image: *image_format,
                        requested: format,
                    });
                }
            }
            ViewTarget::Direct { .. } => return reject(Rejected::DirectHandle("format")),
        }
        self.format = format;
        Ok(())
    }

    pub fn set_components(&mut self, components: vk::ComponentMapping) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view components"));
        }
        self.components = components;
        Ok(())
    }

    pub fn set_subresource_range(&mut self, range: vk::ImageSubresourceRange) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view subresource range"));
        }
        self.subresource_range = range;
        Ok(())
    }

    pub fn set_aspect(&mut self, aspect: vk::ImageAspectFlags) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image view aspect"));
        }
        self.subresource_range.aspect_mask = aspect;
        Ok(())
    }

    /// The owned image, for configuration before `init`.
    pub fn image_mut(&mut self) -> Option<&mut Image> {
        match &mut self.target {
            ViewTarget::Owned(image) => Some(image.as_mut()),
            _ => None,
        }
    }

    /// The owned image, if the view has one.
    pub fn image(&self) -> Option<&Image> {
        match &self.target {
            ViewTarget::Owned(image) => Some(image.as_ref()),
            _ => None,
        }
    }

    /// Initialize the owned image if needed, then create the view.
    ///
    /// An initialized view is finalized first.
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }

        let image = match &mut self.target {
            ViewTarget::None => {
                return Err(GpuError::InvalidState(
                    "image view has no target image".to_string(),
                ))
            }
            ViewTarget::Owned(image) => {
                if !image.is_initialized() {
                    image.init()?;
                }
                image.handle()
            }
            ViewTarget::Borrowed { image, .. } | ViewTarget::Direct { image, .. } => *image,
        };

        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(self.view_type)
            .format(self.format)
            .components(self.components)
            .subresource_range(self.subresource_range);
        self.view = self.device.create_image_view(&info).map_err(|e| {
            error!("Failed to create image view: {e}");
            GpuError::from(e)
        })?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.view != vk::ImageView::null()
    }

    pub const fn handle(&self) -> vk::ImageView {
        self.view
    }

    /// Native handle of the viewed image (null without a target).
    pub fn image_handle(&self) -> vk::Image {
        match &self.target {
            ViewTarget::None => vk::Image::null(),
            ViewTarget::Owned(image) => image.handle(),
            ViewTarget::Borrowed { image, .. } | ViewTarget::Direct { image, .. } => *image,
        }
    }

    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub const fn target(&self) -> &ViewTarget {
        &self.target
    }

    /// Destroy the view, then the owned image if there is one. Safe to repeat.
    pub fn finalize(&mut self) {
        if self.is_initialized() {
            self.device.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if let ViewTarget::Owned(image) = &mut self.target {
            image.finalize();
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.finalize();
    }
}
