//! Device memory arenas.
//!
//! A [`MemoryArena`] owns exactly one native allocation and hands out byte
//! ranges of it with a bump cursor. Space is never reclaimed while the arena
//! lives; the arena is meant for resources that share its lifetime.

use std::fmt;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::device::{Device, DeviceRef};
use crate::error::{reject, GpuError, Rejected, Result, SetResult};

/// An arena that several resources bind into.
pub type SharedArena = Arc<Mutex<MemoryArena>>;

/// A resource that can occupy a range of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl BoundResource {
    fn requirements(self, device: &dyn Device) -> vk::MemoryRequirements {
        match self {
            Self::Buffer(buffer) => device.buffer_memory_requirements(buffer),
            Self::Image(image) => device.image_memory_requirements(image),
        }
    }

    fn bind_native(
        self,
        device: &dyn Device,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        match self {
            Self::Buffer(buffer) => device.bind_buffer_memory(buffer, memory, offset),
            Self::Image(image) => device.bind_image_memory(image, memory, offset),
        }
    }
}

impl fmt::Display for BoundResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(buffer) => write!(f, "buffer {:#x}", buffer.as_raw()),
            Self::Image(image) => write!(f, "image {:#x}", image.as_raw()),
        }
    }
}

/// One entry of an arena's binding log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Offset of the range within the allocation.
    pub start: u64,
    /// Length of the range in bytes.
    pub size: u64,
    /// The resource bound to the range.
    pub resource: BoundResource,
}

impl Binding {
    /// One past the last byte of the range.
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Pick the first memory type allowed by `type_bits` that has every flag in `properties`.
pub fn find_memory_type(
    types: &[vk::MemoryType],
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    types
        .iter()
        .zip(0u32..)
        .find(|(ty, index)| {
            let allowed = 1u32
                .checked_shl(*index)
                .is_some_and(|bit| type_bits & bit != 0);
            allowed && ty.property_flags.contains(properties)
        })
        .map(|(_, index)| index)
}

/// One native allocation sub-divided by a bump cursor.
pub struct MemoryArena {
    device: DeviceRef,
    owner: Option<BoundResource>,
    requirements: Option<vk::MemoryRequirements>,
    properties: vk::MemoryPropertyFlags,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    capacity: u64,
    offset: u64,
    bindings: Vec<Binding>,
}

impl MemoryArena {
    /// Create an uninitialized arena requesting device-local memory.
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            owner: None,
            requirements: None,
            properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            memory: vk::DeviceMemory::null(),
            memory_type_index: 0,
            capacity: 0,
            offset: 0,
            bindings: Vec::new(),
        }
    }

    /// Wrap the arena for binding by several resources.
    pub fn into_shared(self) -> SharedArena {
        Arc::new(Mutex::new(self))
    }

    /// Make `owner` the single resource this arena is sized for and bound to on `init`.
    pub fn set_owner(&mut self, owner: BoundResource) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("arena owner"));
        }
        self.owner = Some(owner);
        Ok(())
    }

    /// Size and type bits for an arena with no owner.
    pub fn set_requirements(&mut self, requirements: vk::MemoryRequirements) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("memory requirements"));
        }
        self.requirements = Some(requirements);
        Ok(())
    }

    /// Property flags the chosen memory type must have.
    pub fn set_property_flags(&mut self, properties: vk::MemoryPropertyFlags) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("memory property flags"));
        }
        self.properties = properties;
        Ok(())
    }

    /// Allocate the native memory.
    ///
    /// With an owner set, the owner's requirements are queried and the owner
    /// is bound at offset zero as part of this call.
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Err(GpuError::InvalidState(
                "memory arena already initialized".to_string(),
            ));
        }

        let (requirements, owner) = match (self.owner, self.requirements) {
            (Some(owner), _) => (owner.requirements(self.device.as_ref()), Some(owner)),
            (None, Some(requirements)) if requirements.size > 0 => (requirements, None),
            _ => return Err(GpuError::MissingMemoryRequirements),
        };

        let memory_type_index = find_memory_type(
            &self.device.memory_types(),
            requirements.memory_type_bits,
            self.properties,
        )
        .ok_or(GpuError::NoSuitableMemoryType {
            type_bits: requirements.memory_type_bits,
            properties: self.properties,
        })?;

        self.memory = self
            .device
            .allocate_memory(requirements.size, memory_type_index)
            .map_err(|e| {
                error!("Failed to allocate {} bytes: {e}", requirements.size);
                GpuError::from(e)
            })?;
        self.memory_type_index = memory_type_index;
        self.capacity = requirements.size;
        self.requirements = Some(requirements);

        debug!(
            "Allocated {} bytes of memory type {} ({:?})",
            requirements.size, memory_type_index, self.properties
        );

        if let Some(owner) = owner {
            if let Err(e) = self.bind(owner, requirements.size) {
                self.finalize();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Bind `resource` at the current offset and advance the cursor by `size`.
    ///
    /// Returns the offset the resource was bound at.
    pub fn bind(&mut self, resource: BoundResource, size: u64) -> Result<u64> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(format!(
                "cannot bind {resource} to an uninitialized arena"
            )));
        }
        if self.bindings.iter().any(|b| b.resource == resource) {
            return Err(GpuError::InvalidState(format!("{resource} is already bound")));
        }

        let start = self.offset;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or(GpuError::ArenaExhausted {
                offset: start,
                requested: size,
                capacity: self.capacity,
            })?;

        resource
            .bind_native(self.device.as_ref(), self.memory, start)
            .map_err(|e| {
                error!("Failed to bind {resource} at offset {start}: {e}");
                GpuError::from(e)
            })?;

        self.bindings.push(Binding {
            start,
            size,
            resource,
        });
        self.offset = end;
        Ok(start)
    }

    /// Where `resource` lives in this arena.
    pub fn offset_and_size(&self, resource: BoundResource) -> Result<(u64, u64)> {
        self.bindings
            .iter()
            .find(|b| b.resource == resource)
            .map(|b| (b.start, b.size))
            .ok_or_else(|| GpuError::ResourceNotBound(resource.to_string()))
    }

    /// Forget `resource`'s binding so its handle can be bound again.
    ///
    /// The range itself is not reclaimed. Returns whether an entry was removed.
    pub fn release(&mut self, resource: BoundResource) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.resource != resource);
        before != self.bindings.len()
    }

    /// Free the native allocation and clear all bookkeeping. Safe to repeat.
    pub fn finalize(&mut self) {
        self.bindings.clear();
        self.offset = 0;
        self.capacity = 0;
        self.owner = None;
        self.requirements = None;
        if self.memory != vk::DeviceMemory::null() {
            self.device.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.memory != vk::DeviceMemory::null()
    }

    /// Native memory handle (null before `init`).
    pub const fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes handed out so far.
    pub const fn used(&self) -> u64 {
        self.offset
    }

    pub const fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub const fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The binding log in bind order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub(crate) fn device(&self) -> &DeviceRef {
        &self.device
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        self.finalize();
    }
}
