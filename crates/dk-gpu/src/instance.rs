//! Vulkan instance creation and physical device selection.

use std::ffi::{CStr, CString};

use ash::vk;
use tracing::{info, warn};

use crate::error::{GpuError, Result};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![
        // Standard validation layer
        c"VK_LAYER_KHRONOS_validation",
    ]
}

/// Create a Vulkan instance with `extensions` enabled.
///
/// `extensions` are usually the surface extensions a window needs (from
/// `ash_window::enumerate_required_extensions`), or empty for headless use.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    extensions: &[*const std::ffi::c_char],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Dk")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut extension_names = extensions.to_vec();
    if cfg!(target_os = "macos") {
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
    }

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are reported, not fatal
    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().ok() == Some(*layer));
            if !found {
                warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Select the best physical device that `is_usable` accepts.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    is_usable: impl Fn(vk::PhysicalDevice) -> bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    let best = devices
        .into_iter()
        .filter(|&device| is_usable(device))
        .map(|device| (score_physical_device(instance, device), device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)?;

    let properties = instance.get_physical_device_properties(best);
    info!(
        "Selected GPU: {:?} ({:?})",
        properties.device_name_as_c_str().unwrap_or(c"unknown"),
        properties.device_type
    );
    Ok(best)
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = instance.get_physical_device_properties(device);

    if vk::api_version_major(properties.api_version) < 1
        || (vk::api_version_major(properties.api_version) == 1
            && vk::api_version_minor(properties.api_version) < 1)
    {
        return -1;
    }

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer more VRAM
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024 * 1024))
        .sum();
    score + i64::try_from(vram_gb).unwrap_or(0)
}

/// Queue families the context takes its queues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, each listed once, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.present] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Choose graphics, compute and present families from `families`.
///
/// A graphics family that can also present is preferred so no ownership
/// transfers are needed; otherwise the first graphics family and the first
/// presenting family are used. Compute prefers a family without graphics
/// support and falls back to the graphics family. Returns `None` if any of
/// the three is missing.
pub fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let indexed = || {
        families
            .iter()
            .enumerate()
            .filter(|(_, family)| family.queue_count > 0)
            .filter_map(|(i, family)| u32::try_from(i).ok().map(|i| (i, family.queue_flags)))
    };
    let has = |flags: vk::QueueFlags, wanted| flags.contains(wanted);

    let graphics = indexed()
        .filter(|&(_, flags)| has(flags, vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i)
        .find(|&i| can_present(i))
        .or_else(|| {
            indexed()
                .find(|&(_, flags)| has(flags, vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i)
        })?;

    let present = if can_present(graphics) {
        graphics
    } else {
        indexed().map(|(i, _)| i).find(|&i| can_present(i))?
    };

    let compute = indexed()
        .find(|&(_, flags)| {
            has(flags, vk::QueueFlags::COMPUTE) && !has(flags, vk::QueueFlags::GRAPHICS)
        })
        .or_else(|| {
            indexed().find(|&(i, flags)| i == graphics && has(flags, vk::QueueFlags::COMPUTE))
        })
        .or_else(|| indexed().find(|&(_, flags)| has(flags, vk::QueueFlags::COMPUTE)))
        .map(|(i, _)| i)?;

    Some(QueueFamilies {
        graphics,
        compute,
        present,
    })
}

/// Queue families of `physical_device`; see [`pick_queue_families`].
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    can_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);
    pick_queue_families(&families, can_present)
}
