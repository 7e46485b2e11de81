//! Instance data structures for GPU upload.

use std::f32::consts::TAU;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{CullError, CullResult};

/// Per-instance data read by the culling kernel and the render material.
///
/// Matches `InstanceRecord` in the WGSL sources (two vec4, 32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// World position in xyz, w = 1.
    pub position: [f32; 4],
    /// Linear RGBA colour.
    pub color: [f32; 4],
}

impl InstanceRecord {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// GPU stride of one record.
    pub const STRIDE: u32 = Self::SIZE as u32;

    /// Creates an instance at a world position.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, color: [f32; 4]) -> Self {
        Self {
            position: [x, y, z, 1.0],
            color,
        }
    }

    /// World position as a vector.
    #[must_use]
    pub fn world_position(&self) -> Vec3 {
        Vec3::new(self.position[0], self.position[1], self.position[2])
    }

    /// Bitwise key, for comparing unordered visible sets.
    #[must_use]
    pub fn sort_key(&self) -> [u32; 8] {
        bytemuck::cast(*self)
    }
}

/// Where the instance population comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum PopulationSource {
    /// Scatter instances on a disc of diameter `area_size` around the origin.
    Random {
        /// Generator seed.
        seed: u64,
    },
    /// Use these records verbatim.
    Explicit(Arc<[InstanceRecord]>),
}

impl Default for PopulationSource {
    fn default() -> Self {
        Self::Random { seed: 0 }
    }
}

impl PopulationSource {
    /// Produces exactly `count` records.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if an explicit population does not have
    /// `count` records.
    pub fn generate(&self, count: u32, area_size: f32) -> CullResult<Vec<InstanceRecord>> {
        match self {
            Self::Random { seed } => Ok(scatter_on_disc(*seed, count, area_size)),
            Self::Explicit(records) => {
                if records.len() != count as usize {
                    return Err(CullError::InvalidConfig(format!(
                        "population has {} records, instance count is {count}",
                        records.len()
                    )));
                }
                Ok(records.to_vec())
            }
        }
    }
}

/// Uniform angle, uniform radius in `[0, area_size / 2)`, on the y = 0 plane,
/// with a random opaque colour.
fn scatter_on_disc(seed: u64, count: u32, area_size: f32) -> Vec<InstanceRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let max_radius = area_size * 0.5;

    (0..count)
        .map(|_| {
            let angle = rng.gen_range(0.0..TAU);
            let distance = if max_radius > 0.0 {
                rng.gen_range(0.0..max_radius)
            } else {
                0.0
            };
            let color = [rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>(), 1.0];
            InstanceRecord::new(angle.cos() * distance, 0.0, angle.sin() * distance, color)
        })
        .collect()
}
