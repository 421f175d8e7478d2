//! Buffers and the staging upload protocol.

use ash::vk;
use tracing::{debug, error};

use crate::command::{BufferBarrier, CommandBuffer, PipelineBarrier};
use crate::device::{DeviceRef, Queue};
use crate::error::{reject, GpuError, Rejected, Result, SetResult};
use crate::memory::{BoundResource, MemoryArena, SharedArena};
use crate::sync::Fence;

/// Where a resource's memory comes from.
pub enum Backing {
    /// A private arena created by the resource's `init` and destroyed by its `finalize`.
    Exclusive(Option<MemoryArena>),
    /// An arena owned elsewhere that the resource binds into.
    Shared(SharedArena),
}

impl Backing {
    /// Bind `resource` to fresh memory. Returns the committed `(offset, size)`.
    pub(crate) fn bind(
        &mut self,
        device: &DeviceRef,
        resource: BoundResource,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(u64, u64)> {
        match self {
            Self::Exclusive(slot) => {
                let mut arena = MemoryArena::new(device.clone());
                arena.set_property_flags(properties)?;
                arena.set_owner(resource)?;
                arena.init()?;
                let committed = arena.offset_and_size(resource)?;
                *slot = Some(arena);
                Ok(committed)
            }
            Self::Shared(shared) => {
                let mut arena = shared.lock();
                let size = match resource {
                    BoundResource::Buffer(buffer) => {
                        arena.device().buffer_memory_requirements(buffer).size
                    }
                    BoundResource::Image(image) => {
                        arena.device().image_memory_requirements(image).size
                    }
                };
                let offset = arena.bind(resource, size)?;
                Ok((offset, size))
            }
        }
    }

    /// Give back whatever `bind` took for `resource`.
    pub(crate) fn release(&mut self, resource: BoundResource) {
        match self {
            Self::Exclusive(slot) => {
                if let Some(mut arena) = slot.take() {
                    arena.finalize();
                }
            }
            Self::Shared(shared) => {
                shared.lock().release(resource);
            }
        }
    }

    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Native memory the resource is bound to, if any.
    pub fn memory(&self) -> vk::DeviceMemory {
        match self {
            Self::Exclusive(Some(arena)) => arena.handle(),
            Self::Exclusive(None) => vk::DeviceMemory::null(),
            Self::Shared(shared) => shared.lock().handle(),
        }
    }
}

/// Stages and accesses that surround an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadBarrier {
    /// Last stage that may still use the old contents.
    pub producing_stage: vk::PipelineStageFlags,
    /// First stage that reads the new contents.
    pub consuming_stage: vk::PipelineStageFlags,
    pub old_access: vk::AccessFlags,
    pub new_access: vk::AccessFlags,
}

/// A GPU buffer and the memory it is bound to.
pub struct Buffer {
    device: DeviceRef,
    buffer: vk::Buffer,
    size: u64,
    usage: vk::BufferUsageFlags,
    sharing_mode: vk::SharingMode,
    queue_families: Vec<u32>,
    memory_properties: vk::MemoryPropertyFlags,
    backing: Backing,
    memory_offset: u64,
    memory_size: u64,
}

impl Buffer {
    /// Create an uninitialized uniform buffer with its own device-local memory.
    pub fn new(device: DeviceRef) -> Self {
        Self::with_backing(device, Backing::Exclusive(None))
    }

    /// Create an uninitialized buffer that binds into `arena` on `init`.
    pub fn with_shared_memory(device: DeviceRef, arena: SharedArena) -> Self {
        Self::with_backing(device, Backing::Shared(arena))
    }

    fn with_backing(device: DeviceRef, backing: Backing) -> Self {
        Self {
            device,
            buffer: vk::Buffer::null(),
            size: 0,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_families: Vec::new(),
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            backing,
            memory_offset: 0,
            memory_size: 0,
        }
    }

    pub fn set_size(&mut self, size: u64) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("buffer size"));
        }
        self.size = size;
        Ok(())
    }

    pub fn set_usage(&mut self, usage: vk::BufferUsageFlags) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("buffer usage"));
        }
        self.usage = usage;
        Ok(())
    }

    /// Share the buffer between `queue_families` (concurrent mode) or keep it exclusive.
    pub fn set_sharing_mode(
        &mut self,
        mode: vk::SharingMode,
        queue_families: &[u32],
    ) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("buffer sharing mode"));
        }
        self.sharing_mode = mode;
        self.queue_families = queue_families.to_vec();
        Ok(())
    }

    /// Property flags of the buffer's private memory.
    pub fn set_memory_properties(&mut self, properties: vk::MemoryPropertyFlags) -> SetResult {
        if self.backing.is_shared() {
            return reject(Rejected::SharedMemory);
        }
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("buffer memory properties"));
        }
        self.memory_properties = properties;
        Ok(())
    }

    /// Create the native buffer and bind it to memory.
    ///
    /// An initialized buffer is finalized first.
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        if self.size == 0 {
            return Err(GpuError::InvalidState(
                "cannot create a zero-sized buffer".to_string(),
            ));
        }

        let mut info = vk::BufferCreateInfo::default()
            .size(self.size)
            .usage(self.usage)
            .sharing_mode(self.sharing_mode);
        if self.sharing_mode == vk::SharingMode::CONCURRENT {
            info = info.queue_family_indices(&self.queue_families);
        }
        let buffer = self.device.create_buffer(&info).map_err(|e| {
            error!("Failed to create buffer of {} bytes: {e}", self.size);
            GpuError::from(e)
        })?;

        let resource = BoundResource::Buffer(buffer);
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
                self.device.destroy_buffer(buffer);
                return Err(e);
            }
        }

        self.buffer = buffer;
        debug!(
            "Created buffer: {} bytes, usage {:?}, {} bytes of memory at offset {}",
            self.size, self.usage, self.memory_size, self.memory_offset
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Offset of the buffer within its memory.
    pub const fn memory_offset(&self) -> u64 {
        self.memory_offset
    }

    /// Bytes of memory committed to the buffer; at least [`Self::size`].
    pub const fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Fill the buffer with `data` through a host-visible staging buffer.
    ///
    /// Records into `cmd` (which must be idle), submits it to `queue` and
    /// blocks until the copy has executed. `signal_semaphores` are signalled
    /// by the submission.
    pub fn push_data(
        &self,
        data: &[u8],
        cmd: &mut CommandBuffer,
        barrier: UploadBarrier,
        signal_semaphores: &[vk::Semaphore],
        queue: &Queue,
    ) -> Result<()> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot push data to an uninitialized buffer".to_string(),
            ));
        }

        let len = u64::try_from(data.len())
            .map_err(|_| GpuError::InvalidState("upload too large".to_string()))?;
        if len > self.size {
            return Err(GpuError::InvalidState(format!(
                "cannot push {len} bytes into a buffer of {} bytes",
                self.size
            )));
        }

        let staging = self.staging(len, vk::BufferUsageFlags::TRANSFER_SRC)?;
        staging.with_mapped(|memory| memory[..data.len()].copy_from_slice(data), true)?;

        cmd.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.pipeline_barrier(
            &PipelineBarrier::new(barrier.producing_stage, vk::PipelineStageFlags::TRANSFER)
                .buffer(BufferBarrier::new(
                    self.buffer,
                    barrier.old_access,
                    vk::AccessFlags::TRANSFER_WRITE,
                )),
        )?;
        cmd.copy_buffer(self, &staging)?;
        cmd.pipeline_barrier(
            &PipelineBarrier::new(vk::PipelineStageFlags::TRANSFER, barrier.consuming_stage)
                .buffer(BufferBarrier::new(
                    self.buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    barrier.new_access,
                )),
        )?;
        cmd.end_recording()?;

        let fence = Fence::create(self.device.clone(), false)?;
        cmd.submit(queue, &[], signal_semaphores, Some(&fence))?;
        fence.wait()?;

        debug!("Uploaded {} bytes to buffer", data.len());
        Ok(())
    }

    /// Copy the buffer's contents back to the host.
    ///
    /// Records into `cmd` (which must be idle), submits it to `queue` and
    /// blocks until the copy has executed.
    pub fn read_back(&self, cmd: &mut CommandBuffer, queue: &Queue) -> Result<Vec<u8>> {
        if !self.is_initialized() {
            return Err(GpuError::InvalidState(
                "cannot read back an uninitialized buffer".to_string(),
            ));
        }

        let staging = self.staging(self.size, vk::BufferUsageFlags::TRANSFER_DST)?;

        cmd.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.pipeline_barrier(
            &PipelineBarrier::new(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
            )
            .buffer(BufferBarrier::new(
                self.buffer,
                vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            )),
        )?;
        cmd.copy_buffer(&staging, self)?;
        cmd.pipeline_barrier(
            &PipelineBarrier::new(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::HOST)
                .buffer(BufferBarrier::new(
                    staging.buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::HOST_READ,
                )),
        )?;
        cmd.end_recording()?;

        let fence = Fence::create(self.device.clone(), false)?;
        cmd.submit(queue, &[], &[], Some(&fence))?;
        fence.wait()?;

        let len = usize::try_from(self.size)
            .map_err(|_| GpuError::Other("buffer too large to read back".to_string()))?;
        staging.with_mapped(|memory| memory[..len].to_vec(), false)
    }

    fn staging(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        let mut staging = Self::new(self.device.clone());
        staging.set_size(size)?;
        staging.set_usage(usage)?;
        staging.set_memory_properties(vk::MemoryPropertyFlags::HOST_VISIBLE)?;
        staging.init()?;
        Ok(staging)
    }

    /// Map the buffer's memory for the duration of `f`.
    ///
    /// With `write` set the range is flushed afterwards, otherwise it is
    /// invalidated before `f` runs.
    fn with_mapped<T>(&self, f: impl FnOnce(&mut [u8]) -> T, write: bool) -> Result<T> {
        let memory = self.backing.memory();
        let len = usize::try_from(self.memory_size)
            .map_err(|_| GpuError::Other("mapping too large".to_string()))?;
        let ptr = self
            .device
            .map_memory(memory, self.memory_offset, self.memory_size)
            .map_err(|e| {
                error!("Failed to map buffer memory: {e}");
                GpuError::from(e)
            })?;

        if !write {
            if let Err(e) =
                self.device
                    .invalidate_mapped_range(memory, self.memory_offset, self.memory_size)
            {
                self.device.unmap_memory(memory);
                return Err(e.into());
            }
        }

        // SAFETY: `ptr` maps `memory_size` bytes at `memory_offset`, owned by
        // this buffer's binding. The slice does not outlive `f`, and the
        // range stays mapped until `unmap_memory` below.
        let mapped = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        let result = f(mapped);

        let flushed = if write {
            self.device
                .flush_mapped_range(memory, self.memory_offset, self.memory_size)
        } else {
            Ok(())
        };
        self.device.unmap_memory(memory);
        flushed?;
        Ok(result)
    }

    /// Release the memory binding and destroy the native buffer. Safe to repeat.
    pub fn finalize(&mut self) {
        if !self.is_initialized() {
            return;
        }
        self.backing.release(BoundResource::Buffer(self.buffer));
        self.device.destroy_buffer(self.buffer);
        self.buffer = vk::Buffer::null();
        self.memory_offset = 0;
        self.memory_size = 0;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.finalize();
    }
}
