//! Device-resident pool of every instance.
//!
//! Uploaded once per configuration and only ever read afterwards.

use super::instance_data::InstanceRecord;
use crate::backend::{BufferDesc, BufferId, BufferKind, GpuBackend};
use crate::error::{CullError, CullResult};

/// Read-only device buffer holding the full population.
#[derive(Debug, PartialEq, Eq)]
pub struct InstancePool {
    buffer: BufferId,
    len: u32,
}

impl InstancePool {
    /// Allocates the pool and copies `records` into it in one upload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `records` is empty or its length differs
    /// from `expected_count`, or the backend's allocation error.
    pub fn upload<B: GpuBackend>(
        backend: &mut B,
        records: &[InstanceRecord],
        expected_count: u32,
    ) -> CullResult<Self> {
        if records.is_empty() {
            return Err(CullError::InvalidConfig("instance population is empty".into()));
        }
        if records.len() != expected_count as usize {
            return Err(CullError::InvalidConfig(format!(
                "uploading {} records into a pool configured for {expected_count}",
                records.len()
            )));
        }

        let desc = BufferDesc {
            label: "instacull.all_instances",
            kind: BufferKind::Structured,
            element_count: expected_count,
            stride: InstanceRecord::STRIDE,
        };
        let buffer = backend.create_buffer(&desc, Some(bytemuck::cast_slice(records)))?;

        tracing::debug!(
            "Instance pool uploaded: {} records ({} bytes)",
            expected_count,
            desc.size_bytes()
        );

        Ok(Self {
            buffer,
            len: expected_count,
        })
    }

    /// Device buffer handle.
    #[must_use]
    pub const fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Number of instances.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Always false: an empty pool cannot be uploaded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frees the device buffer.
    pub fn release<B: GpuBackend>(self, backend: &mut B) {
        backend.release_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn test_upload_sizes_buffer() {
        let mut backend = SoftwareBackend::new();
        let records = vec![InstanceRecord::new(1.0, 2.0, 3.0, [1.0; 4]); 10];

        let pool = InstancePool::upload(&mut backend, &records, 10).unwrap();
        assert_eq!(pool.len(), 10);
        assert_eq!(backend.buffer_size(pool.buffer()), Some(320));

        let stored: &[InstanceRecord] = bytemuck::cast_slice(backend.buffer_words(pool.buffer()).unwrap());
        assert_eq!(stored, records.as_slice());

        pool.release(&mut backend);
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_upload_rejects_bad_populations() {
        let mut backend = SoftwareBackend::new();
        assert!(InstancePool::upload(&mut backend, &[], 0).is_err());

        let records = vec![InstanceRecord::default(); 3];
        assert!(matches!(
            InstancePool::upload(&mut backend, &records, 4),
            Err(CullError::InvalidConfig(_))
        ));
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
