//! Vertex meshes.

use std::mem::size_of;

use ash::vk;
use glam::Vec3;
use tracing::debug;

use crate::buffer::{Buffer, UploadBarrier};
use crate::command::CommandBuffer;
use crate::device::{DeviceRef, Queue};
use crate::error::{GpuError, Result};

#[allow(clippy::cast_possible_truncation)]
const VERTEX_STRIDE: u32 = size_of::<Vec3>() as u32;

/// Vertex input state a pipeline needs to read a [`Mesh`].
#[derive(Debug, Clone, Copy)]
pub struct VertexInput {
    pub binding: vk::VertexInputBindingDescription,
    pub attribute: vk::VertexInputAttributeDescription,
}

/// Positions on the CPU plus the vertex buffer they were uploaded to.
pub struct Mesh {
    vertices: Vec<Vec3>,
    binding_index: u32,
    buffer: Option<Buffer>,
    external: bool,
}

impl Mesh {
    pub const fn new(binding_index: u32) -> Self {
        Self {
            vertices: Vec::new(),
            binding_index,
            buffer: None,
            external: false,
        }
    }

    pub fn add_vertices(&mut self, vertices: &[Vec3]) {
        self.vertices.extend_from_slice(vertices);
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn vertex_count(&self) -> u32 {
        u32::try_from(self.vertices.len()).unwrap_or(u32::MAX)
    }

    pub const fn binding_index(&self) -> u32 {
        self.binding_index
    }

    /// Vertex input descriptions for reading positions from `binding`.
    ///
    /// `binding` also becomes the mesh's binding index.
    pub fn vertex_input(&mut self, binding: u32) -> VertexInput {
        self.binding_index = binding;
        VertexInput {
            binding: vk::VertexInputBindingDescription {
                binding,
                stride: VERTEX_STRIDE,
                input_rate: vk::VertexInputRate::VERTEX,
            },
            attribute: vk::VertexInputAttributeDescription {
                location: 0,
                binding,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
        }
    }

    /// Use a vertex buffer filled elsewhere. [`Self::init_buffer`] refuses to
    /// replace it.
    pub fn set_vertex_buffer(&mut self, buffer: Buffer) {
        self.buffer = Some(buffer);
        self.external = true;
    }

    pub const fn vertex_buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Create a device-local vertex buffer and upload the vertices into it.
    ///
    /// Records into `cmd` (which must be idle) and blocks until the upload
    /// has executed on `queue`; `cmd` is left submitted.
    pub fn init_buffer(
        &mut self,
        device: DeviceRef,
        cmd: &mut CommandBuffer,
        queue: &Queue,
    ) -> Result<()> {
        if self.external {
            return Err(GpuError::InvalidState(
                "mesh already uses an external vertex buffer".to_string(),
            ));
        }
        if self.buffer.is_some() {
            return Err(GpuError::InvalidState(
                "finalize the mesh buffer before creating a new one".to_string(),
            ));
        }
        if self.vertices.is_empty() {
            return Err(GpuError::InvalidState(
                "cannot upload a mesh without vertices".to_string(),
            ));
        }

        let bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let mut buffer = Buffer::new(device);
        buffer.set_size(bytes.len() as u64)?;
        buffer
            .set_usage(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)?;
        buffer.init()?;
        buffer.push_data(
            bytes,
            cmd,
            UploadBarrier {
                producing_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                consuming_stage: vk::PipelineStageFlags::VERTEX_INPUT,
                old_access: vk::AccessFlags::empty(),
                new_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            },
            &[],
            queue,
        )?;

        debug!("Uploaded mesh with {} vertices", self.vertices.len());
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Destroy a buffer created by [`Self::init_buffer`]. External buffers are kept.
    pub fn finalize_buffer(&mut self) {
        if !self.external {
            self.buffer = None;
        }
    }

    /// Drop the vertices and the owned buffer.
    pub fn finalize(&mut self) {
        self.finalize_buffer();
        self.vertices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::fake::FakeDevice;

    const QUEUE: Queue = Queue::new(vk::Queue::null(), 0);

    fn triangle() -> Mesh {
        let mut mesh = Mesh::new(0);
        mesh.add_vertices(&[Vec3::new(0.0, -0.5, 0.0), Vec3::new(0.5, 0.5, 0.0)]);
        mesh.add_vertices(&[Vec3::new(-0.5, 0.5, 0.0)]);
        mesh
    }

    #[test]
    fn vertex_input_describes_positions() {
        let mut mesh = triangle();
        let input = mesh.vertex_input(2);
        assert_eq!(mesh.binding_index(), 2);
        assert_eq!(input.binding.binding, 2);
        assert_eq!(input.binding.stride, 12);
        assert_eq!(input.attribute.binding, 2);
        assert_eq!(input.attribute.format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn init_buffer_uploads_vertices() {
        let fake = FakeDevice::new();
        let mut pool = CommandPool::create(fake.clone(), &QUEUE).unwrap();
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cmd = pool.buffer_mut(&id).unwrap();

        let mut mesh = triangle();
        assert_eq!(mesh.vertex_count(), 3);
        mesh.init_buffer(fake.clone(), cmd, &QUEUE).unwrap();

        let buffer = mesh.vertex_buffer().unwrap();
        assert_eq!(buffer.size(), 36);
        assert!(buffer.usage().contains(vk::BufferUsageFlags::VERTEX_BUFFER));

        cmd.reset().unwrap();
        let bytes = buffer.read_back(cmd, &QUEUE).unwrap();
        let expected: &[u8] = bytemuck::cast_slice(mesh.vertices());
        assert_eq!(bytes, expected);

        cmd.reset().unwrap();
        assert!(matches!(
            mesh.init_buffer(fake.clone(), cmd, &QUEUE),
            Err(GpuError::InvalidState(_))
        ));
        mesh.finalize();
        assert_eq!(mesh.vertex_count(), 0);
        assert_eq!(fake.live_count("buffer"), 0);
    }

    #[test]
    fn external_buffer_is_kept() {
        let fake = FakeDevice::new();
        let mut pool = CommandPool::create(fake.clone(), &QUEUE).unwrap();
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cmd = pool.buffer_mut(&id).unwrap();

        let mut buffer = Buffer::new(fake.clone());
        buffer.set_size(12).unwrap();
        buffer.init().unwrap();
        let handle = buffer.handle();

        let mut mesh = triangle();
        mesh.set_vertex_buffer(buffer);
        assert!(mesh.init_buffer(fake.clone(), cmd, &QUEUE).is_err());
        mesh.finalize_buffer();
        assert_eq!(mesh.vertex_buffer().map(Buffer::handle), Some(handle));
    }

    #[test]
    fn empty_mesh_is_not_uploaded() {
        let fake = FakeDevice::new();
        let mut pool = CommandPool::create(fake.clone(), &QUEUE).unwrap();
        let id = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
        let cmd = pool.buffer_mut(&id).unwrap();
        let mut mesh = Mesh::new(0);
        assert!(mesh.init_buffer(fake.clone(), cmd, &QUEUE).is_err());
        assert_eq!(fake.live_count("buffer"), 0);
    }
}
