//! Images.

use ash::vk;
use tracing::{debug, error};

use crate::buffer::Backing;
use crate::device::DeviceRef;
use crate::error::{reject, GpuError, Rejected, Result, SetResult};
use crate::memory::{BoundResource, SharedArena};

/// A GPU image and the memory it is bound to.
///
/// Defaults describe a single-sampled 2D colour attachment in
/// `B8G8R8A8_UNORM` with one mip level and one layer.
pub struct Image {
    device: DeviceRef,
    image: vk::Image,
    flags: vk::ImageCreateFlags,
    image_type: vk::ImageType,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    samples: vk::SampleCountFlags,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    sharing_mode: vk::SharingMode,
    queue_families: Vec<u32>,
    memory_properties: vk::MemoryPropertyFlags,
    backing: Backing,
    memory_offset: u64,
    memory_size: u64,
}

macro_rules! frozen_setter {
    ($(#[$meta:meta])* $name:ident, $field:ident: $ty:ty, $what:literal) => {
        $(#[$meta])*
        pub fn $name(&mut self, $field: $ty) -> SetResult {
            if self.is_initialized() {
                return reject(Rejected::AlreadyInitialized($what));
            }
            self.$field = $field;
            Ok(())
        }
    };
}

impl Image {
    /// Create an uninitialized image with its own device-local memory.
    pub fn new(device: DeviceRef) -> Self {
        Self::with_backing(device, Backing::Exclusive(None))
    }

    /// Create an uninitialized image that binds into `arena` on `init`.
    pub fn with_shared_memory(device: DeviceRef, arena: SharedArena) -> Self {
        Self::with_backing(device, Backing::Shared(arena))
    }

    fn with_backing(device: DeviceRef, backing: Backing) -> Self {
        Self {
            device,
            image: vk::Image::null(),
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent3D::default(),
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_families: Vec::new(),
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            backing,
            memory_offset: 0,
            memory_size: 0,
        }
    }

    frozen_setter!(set_flags, flags: vk::ImageCreateFlags, "image create flags");
    frozen_setter!(set_image_type, image_type: vk::ImageType, "image type");
    frozen_setter!(set_format, format: vk::Format, "image format");
    frozen_setter!(
        /// Size in texels; depth is 1 for 2D images.
        set_extent,
        extent: vk::Extent3D,
        "image extent"
    );
    frozen_setter!(set_mip_levels, mip_levels: u32, "image mip levels");
    frozen_setter!(set_array_layers, array_layers: u32, "image array layers");
    frozen_setter!(set_samples, samples: vk::SampleCountFlags, "image sample count");
    frozen_setter!(set_tiling, tiling: vk::ImageTiling, "image tiling");
    frozen_setter!(set_usage, usage: vk::ImageUsageFlags, "image usage");

    /// Share the image between `queue_families` (concurrent mode) or keep it exclusive.
    pub fn set_sharing_mode(
        &mut self,
        mode: vk::SharingMode,
        queue_families: &[u32],
    ) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image sharing mode"));
        }
        self.sharing_mode = mode;
        self.queue_families = queue_families.to_vec();
        Ok(())
    }

    /// Property flags of the image's private memory.
    pub fn set_memory_properties(&mut self, properties: vk::MemoryPropertyFlags) -> SetResult {
        if self.backing.is_shared() {
            return reject(Rejected::SharedMemory);
        }
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("image memory properties"));
        }
        self.memory_properties = properties;
        Ok(())
    }

    /// Create the native image and bind it to memory.
    ///
    /// An initialized image is finalized first.
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        if self.extent.width == 0 || self.extent.height == 0 || self.extent.depth == 0 {
            return Err(GpuError::InvalidState(format!(
                "cannot create an image of extent {}x{}x{}",
                self.extent.width, self.extent.height, self.extent.depth
            )));
        }

        let mut info = vk::ImageCreateInfo::default()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(self.sharing_mode)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if self.sharing_mode == vk::SharingMode::CONCURRENT {
            info = info.queue_family_indices(&self.queue_families);
        }
        let image = self.device.create_image(&info).map_err(|e| {
            error!("Failed to create {:?} image: {e}", self.format);
            GpuError::from(e)
        })?;

        let resource = BoundResource::Image(image);
        match self
            .backing
            .bind(&self.device, resource, self.memory_properties)
        {
            Ok((offset, size)) => {
                self.memory_offset = offset;
                self.memory_size = size;
            }
            Err(e) => {
                self.backing.release(resource);
                self.device.destroy_image(image);
                return Err(e);
            }
        }

        self.image = image;
        debug!(
            "Created {}x{} {:?} image",
            self.extent.width, self.extent.height, self.format
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.image != vk::Image::null()
    }

    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub const fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub const fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub const fn memory_offset(&self) -> u64 {
        self.memory_offset
    }

    pub const fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Release the memory binding and destroy the native image. Safe to repeat.
    pub fn finalize(&mut self) {
        if !self.is_initialized() {
            return;
        }
        self.backing.release(BoundResource::Image(self.image));
        self.device.destroy_image(self.image);
        self.image = vk::Image::null();
        self.memory_offset = 0;
        self.memory_size = 0;
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDevice;
    use crate::memory::MemoryArena;

    fn extent(width: u32, height: u32) -> vk::Extent3D {
        vk::Extent3D {
            width,
            height,
            depth: 1,
        }
    }

    #[test]
    fn defaults_reach_the_driver() {
        let fake = FakeDevice::new();
        let mut image = Image::new(fake.clone());
        image.set_extent(extent(64, 32)).unwrap();
        image.init().unwrap();

        assert_eq!(
            fake.image_info(image.handle()),
            Some((vk::Format::B8G8R8A8_UNORM, extent(64, 32)))
        );
        assert_eq!(image.usage(), vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(
            fake.image_binding(image.handle()),
            Some((image.backing().memory(), 0))
        );
        assert!(image.memory_size() >= 64 * 32 * 4);
    }

    #[test]
    fn empty_extent_is_rejected() {
        let fake = FakeDevice::new();
        let mut image = Image::new(fake.clone());
        assert!(matches!(image.init(), Err(GpuError::InvalidState(_))));
        assert_eq!(fake.live_count("image"), 0);
    }

    #[test]
    fn setters_rejected_after_init() {
        let fake = FakeDevice::new();
        let mut image = Image::new(fake.clone());
        image.set_extent(extent(4, 4)).unwrap();
        image.set_format(vk::Format::R8G8B8A8_UNORM).unwrap();
        image.init().unwrap();

        assert_eq!(
            image.set_format(vk::Format::D16_UNORM),
            Err(Rejected::AlreadyInitialized("image format"))
        );
        assert_eq!(image.format(), vk::Format::R8G8B8A8_UNORM);
        assert!(image.set_extent(extent(8, 8)).is_err());
        assert_eq!(image.extent(), extent(4, 4));
    }

    #[test]
    fn shared_images_release_their_binding_only() {
        let fake = FakeDevice::new();
        let mut arena = MemoryArena::new(fake.clone());
        arena
            .set_requirements(vk::MemoryRequirements {
                size: 1 << 20,
                alignment: 4096,
                memory_type_bits: 1,
            })
            .unwrap();
        arena.init().unwrap();
        let arena = arena.into_shared();

        let mut first = Image::with_shared_memory(fake.clone(), arena.clone());
        first.set_extent(extent(16, 16)).unwrap();
        first.init().unwrap();
        let mut second = Image::with_shared_memory(fake.clone(), arena.clone());
        second.set_extent(extent(16, 16)).unwrap();
        second.init().unwrap();

        assert_eq!(second.memory_offset(), first.memory_size());
        drop(first);
        assert_eq!(arena.lock().bindings().len(), 1);
        assert_eq!(fake.destroy_count("memory"), 0);
    }

    #[test]
    fn finalize_twice_destroys_once() {
        let fake = FakeDevice::new();
        let mut image = Image::new(fake.clone());
        image.set_extent(extent(2, 2)).unwrap();
        image.init().unwrap();
        image.finalize();
        image.finalize();
        drop(image);
        assert_eq!(fake.destroy_count("image"), 1);
        assert_eq!(fake.destroy_count("memory"), 1);
        assert_eq!(fake.invalid_destroys(), 0);
    }
}
