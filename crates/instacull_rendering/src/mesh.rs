//! Render mesh description and the built-in cube.
//!
//! The culler only needs three things from a mesh: a device handle to draw,
//! the index range of submesh 0, and the local bounds extents used to size
//! every instance's bounding sphere.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::backend::MeshId;

/// Index range of one submesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRange {
    /// Number of indices.
    pub index_count: u32,
    /// First index.
    pub start_index: u32,
    /// Value added to every index.
    pub base_vertex: u32,
}

/// A mesh uploaded to a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshDesc {
    /// Backend handle.
    pub mesh: MeshId,
    /// Half-size of the local bounding box.
    pub bounds_extents: [f32; 3],
    /// Submesh 0.
    pub submesh: IndexRange,
}

impl MeshDesc {
    /// Bounding-sphere radius of one instance: `|extents| * multiplier`.
    #[must_use]
    pub fn instance_radius(&self, radius_multiplier: f32) -> f32 {
        Vec3::from_array(self.bounds_extents).length() * radius_multiplier
    }
}

/// Vertex of the built-in meshes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Object-space position.
    pub position: [f32; 3],
}

/// CPU-side mesh geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGeometry {
    /// Vertices.
    pub vertices: Vec<MeshVertex>,
    /// Triangle list indices.
    pub indices: Vec<u32>,
    /// Half-size of the bounding box.
    pub bounds_extents: [f32; 3],
}

impl MeshGeometry {
    /// Axis-aligned cube with the given half size, 24 vertices, 36 indices.
    #[must_use]
    pub fn cube(half: f32) -> Self {
        // (normal, u, v) per face with u x v = normal
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);

        for (normal, u, v) in FACES {
            let n = Vec3::from_array(normal);
            let u = Vec3::from_array(u);
            let v = Vec3::from_array(v);
            let base = vertices.len() as u32;

            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let p = (n + u * su + v * sv) * half;
                vertices.push(MeshVertex {
                    position: p.to_array(),
                });
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self {
            vertices,
            indices,
            bounds_extents: [half; 3],
        }
    }

    /// Index range covering the whole geometry.
    #[must_use]
    pub fn full_range(&self) -> IndexRange {
        IndexRange {
            index_count: self.indices.len() as u32,
            start_index: 0,
            base_vertex: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_geometry() {
        let cube = MeshGeometry::cube(0.5);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertices.len()));
        for vertex in &cube.vertices {
            assert!(vertex.position.iter().all(|c| (c.abs() - 0.5).abs() < 1e-6));
        }
        assert_eq!(cube.full_range().index_count, 36);
    }

    #[test]
    fn test_instance_radius() {
        let mesh = MeshDesc {
            mesh: MeshId::new(0),
            bounds_extents: [0.5, 0.5, 0.5],
            submesh: IndexRange::default(),
        };
        let expected = 0.75f32.sqrt();
        assert!((mesh.instance_radius(1.0) - expected).abs() < 1e-6);
        assert!((mesh.instance_radius(2.0) - 2.0 * expected).abs() < 1e-6);
        assert_eq!(mesh.instance_radius(0.0), 0.0);
    }
}
