//! View frustum planes.
//!
//! Extracts the six clipping planes from a view-projection matrix and tests
//! bounding spheres against them.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// A plane in 3D space (Ax + By + Cz + D = 0).
///
/// The normal (A, B, C) points toward the inside half-space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Plane {
    /// Normal X component.
    pub a: f32,
    /// Normal Y component.
    pub b: f32,
    /// Normal Z component.
    pub c: f32,
    /// Distance from origin.
    pub d: f32,
}

impl Plane {
    /// Creates a new plane.
    #[must_use]
    pub const fn new(a: f32, b: f32, c: f32, d: f32) -> Self {
        Self { a, b, c, d }
    }

    /// Creates a plane from a normal and a distance.
    #[must_use]
    pub fn from_normal_distance(normal: Vec3, distance: f32) -> Self {
        Self::new(normal.x, normal.y, normal.z, distance)
    }

    /// Normalizes the plane.
    #[must_use]
    pub fn normalized(self) -> Self {
        let len = self.normal().length();
        if len > 0.0 {
            Self {
                a: self.a / len,
                b: self.b / len,
                c: self.c / len,
                d: self.d / len,
            }
        } else {
            self
        }
    }

    /// Returns the plane normal.
    #[inline]
    #[must_use]
    pub fn normal(&self) -> Vec3 {
        Vec3::new(self.a, self.b, self.c)
    }

    /// Returns the signed distance from a point to the plane.
    #[inline]
    #[must_use]
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal().dot(point) + self.d
    }

    /// Converts to array format (xyz = normal, w = distance).
    #[must_use]
    pub const fn as_array(&self) -> [f32; 4] {
        [self.a, self.b, self.c, self.d]
    }

    /// Creates a plane from array format.
    #[must_use]
    pub const fn from_array(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// View frustum for culling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far planes.
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Left plane index.
    pub const LEFT: usize = 0;
    /// Right plane index.
    pub const RIGHT: usize = 1;
    /// Bottom plane index.
    pub const BOTTOM: usize = 2;
    /// Top plane index.
    pub const TOP: usize = 3;
    /// Near plane index.
    pub const NEAR: usize = 4;
    /// Far plane index.
    pub const FAR: usize = 5;

    /// Extracts frustum planes from a view-projection matrix.
    ///
    /// Gribb & Hartmann extraction for a 0..1 clip-space depth range
    /// (wgpu/D3D convention), so the near plane is row 2 alone.
    #[must_use]
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let m = view_projection.to_cols_array_2d();
        let mut planes = [Plane::default(); 6];

        // Left plane: row3 + row0
        planes[Self::LEFT] = Plane::new(
            m[0][3] + m[0][0],
            m[1][3] + m[1][0],
            m[2][3] + m[2][0],
            m[3][3] + m[3][0],
        )
        .normalized();

        // Right plane: row3 - row0
        planes[Self::RIGHT] = Plane::new(
            m[0][3] - m[0][0],
            m[1][3] - m[1][0],
            m[2][3] - m[2][0],
            m[3][3] - m[3][0],
        )
        .normalized();

        // Bottom plane: row3 + row1
        planes[Self::BOTTOM] = Plane::new(
            m[0][3] + m[0][1],
            m[1][3] + m[1][1],
            m[2][3] + m[2][1],
            m[3][3] + m[3][1],
        )
        .normalized();

        // Top plane: row3 - row1
        planes[Self::TOP] = Plane::new(
            m[0][3] - m[0][1],
            m[1][3] - m[1][1],
            m[2][3] - m[2][1],
            m[3][3] - m[3][1],
        )
        .normalized();

        // Near plane: row2
        planes[Self::NEAR] = Plane::new(m[0][2], m[1][2], m[2][2], m[3][2]).normalized();

        // Far plane: row3 - row2
        planes[Self::FAR] = Plane::new(
            m[0][3] - m[0][2],
            m[1][3] - m[1][2],
            m[2][3] - m[2][2],
            m[3][3] - m[3][2],
        )
        .normalized();

        Self { planes }
    }

    /// Converts planes to array format for GPU upload.
    #[must_use]
    pub fn as_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|plane| plane.as_array())
    }

    /// Builds a frustum from array format.
    #[must_use]
    pub fn from_arrays(planes: [[f32; 4]; 6]) -> Self {
        Self {
            planes: planes.map(Plane::from_array),
        }
    }

    /// Tests if a sphere is visible (intersects the frustum).
    ///
    /// Conservative: a sphere straddling a plane counts as visible.
    #[must_use]
    pub fn test_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.distance_to_point(center) >= -radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        let view = Mat4::look_to_lh(Vec3::ZERO, Vec3::Z, Vec3::Y);
        let proj = Mat4::perspective_lh(60f32.to_radians(), 1.0, 0.3, 500.0);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn test_plane_normalization() {
        let plane = Plane::new(3.0, 4.0, 0.0, 10.0);
        let normalized = plane.normalized();

        // 3-4-5 triangle, so length is 5
        assert!((normalized.a - 0.6).abs() < 0.001);
        assert!((normalized.b - 0.8).abs() < 0.001);
        assert!((normalized.d - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_near_and_far_planes() {
        let frustum = camera_frustum();
        let near = frustum.planes[Frustum::NEAR];
        let far = frustum.planes[Frustum::FAR];

        assert!((near.c - 1.0).abs() < 1e-4);
        assert!((near.d + 0.3).abs() < 1e-3);
        assert!((far.c + 1.0).abs() < 1e-4);
        assert!((far.d - 500.0).abs() < 0.5);
    }

    #[test]
    fn test_sphere_containment() {
        let frustum = camera_frustum();

        assert!(frustum.test_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
        // Behind the camera.
        assert!(!frustum.test_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0));
        // Past the far plane, but the radius reaches back inside.
        assert!(frustum.test_sphere(Vec3::new(0.0, 0.0, 500.5), 1.0));
        assert!(!frustum.test_sphere(Vec3::new(0.0, 0.0, 502.0), 1.0));
    }

    #[test]
    fn test_array_round_trip_keeps_plane_order() {
        let frustum = camera_frustum();
        let arrays = frustum.as_arrays();
        assert_eq!(arrays[Frustum::FAR], frustum.planes[Frustum::FAR].as_array());
        assert_eq!(Frustum::from_arrays(arrays), frustum);
    }
}
