//! Append buffer receiving the compacted visible set.
//!
//! The surface never talks to the host after allocation. Its counter is
//! reset and copied through commands recorded into the frame's stream, so
//! the visible count moves device-to-device only.

use super::instance_data::InstanceRecord;
use crate::backend::{BufferDesc, BufferId, BufferKind, CommandStream, FrameCommand, GpuBackend};
use crate::error::CullResult;

/// Append-structured device buffer plus its live counter.
#[derive(Debug, PartialEq, Eq)]
pub struct VisibilitySurface {
    buffer: BufferId,
    capacity: u32,
}

impl VisibilitySurface {
    /// Allocates a surface able to hold `capacity` records.
    ///
    /// # Errors
    ///
    /// Returns the backend's allocation error.
    pub fn allocate<B: GpuBackend>(backend: &mut B, capacity: u32) -> CullResult<Self> {
        let desc = BufferDesc {
            label: "instacull.visible_instances",
            kind: BufferKind::Append,
            element_count: capacity,
            stride: InstanceRecord::STRIDE,
        };
        let buffer = backend.create_buffer(&desc, None)?;

        Ok(Self { buffer, capacity })
    }

    /// Device buffer handle.
    #[must_use]
    pub const fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Maximum number of records.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Records "live counter := 0".
    pub fn reset_count(&self, stream: &mut CommandStream) {
        stream.push(FrameCommand::ResetCounter {
            buffer: self.buffer,
        });
    }

    /// Records a copy of the live counter into 4 bytes of `target`.
    pub fn copy_count_into(&self, stream: &mut CommandStream, target: BufferId, offset_bytes: u64) {
        stream.push(FrameCommand::CopyCounter {
            source: self.buffer,
            target,
            offset_bytes,
        });
    }

    /// Frees the device buffer and its counter.
    pub fn release<B: GpuBackend>(self, backend: &mut B) {
        backend.release_buffer(self.buffer);
    }
}
