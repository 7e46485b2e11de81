//! Indirect draw arguments.
//!
//! Five little-endian `u32` in fixed order. This is the indexed indirect
//! draw ABI and must not be reordered.

use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferDesc, BufferId, BufferKind, GpuBackend};
use crate::error::CullResult;
use crate::mesh::IndexRange;

/// Byte offset of `instance_count` inside [`DrawArguments`].
pub const INSTANCE_COUNT_OFFSET: u64 = std::mem::size_of::<u32>() as u64;

/// Indexed, instanced indirect draw parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawArguments {
    /// Indices per instance.
    pub index_count: u32,
    /// Instances to draw (written on the device every frame).
    pub instance_count: u32,
    /// First index in the index buffer.
    pub start_index: u32,
    /// Value added to every index.
    pub base_vertex: u32,
    /// First instance (always 0).
    pub start_instance: u32,
}

impl DrawArguments {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Arguments for a mesh range with no instances yet.
    #[must_use]
    pub const fn for_range(range: &IndexRange) -> Self {
        Self {
            index_count: range.index_count,
            instance_count: 0,
            start_index: range.start_index,
            base_vertex: range.base_vertex,
            start_instance: 0,
        }
    }

    /// Little-endian wire image.
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let fields = [
            self.index_count,
            self.instance_count,
            self.start_index,
            self.base_vertex,
            self.start_instance,
        ];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Decodes the little-endian wire image.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self {
            index_count: field(0),
            instance_count: field(1),
            start_index: field(2),
            base_vertex: field(3),
            start_instance: field(4),
        }
    }
}

/// Device buffer holding one [`DrawArguments`].
#[derive(Debug, PartialEq, Eq)]
pub struct IndirectDrawArguments {
    buffer: BufferId,
    initial: DrawArguments,
}

impl IndirectDrawArguments {
    /// Allocates the buffer and writes the mesh range with zero instances.
    ///
    /// After this the host never writes the buffer again; `instance_count`
    /// is refreshed by the visibility surface's counter copy.
    ///
    /// # Errors
    ///
    /// Returns the backend's allocation error.
    pub fn initialize<B: GpuBackend>(backend: &mut B, range: &IndexRange) -> CullResult<Self> {
        let initial = DrawArguments::for_range(range);
        let desc = BufferDesc {
            label: "instacull.draw_arguments",
            kind: BufferKind::IndirectArguments,
            element_count: 1,
            stride: DrawArguments::SIZE as u32,
        };
        let buffer = backend.create_buffer(&desc, Some(&initial.to_le_bytes()))?;

        Ok(Self { buffer, initial })
    }

    /// Device buffer handle.
    #[must_use]
    pub const fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// The arguments as uploaded (instance count 0).
    #[must_use]
    pub const fn initial(&self) -> DrawArguments {
        self.initial
    }

    /// Frees the device buffer.
    pub fn release<B: GpuBackend>(self, backend: &mut B) {
        backend.release_buffer(self.buffer);
    }
}
