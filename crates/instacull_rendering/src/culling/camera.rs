//! Camera state consumed by the culler.
//!
//! The culler does not own or drive cameras. A host hands it a
//! [`CameraProvider`] each frame; whatever the provider returns is turned
//! into culling parameters for that frame only.

use glam::{Mat4, Vec3};

use super::frustum::Frustum;

/// Snapshot of the active camera for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// Culling frustum in world space.
    pub frustum: Frustum,
    /// View-projection matrix used by the render material.
    pub view_projection: Mat4,
    /// Camera transform (local to world).
    pub local_to_world: Mat4,
    /// Far clip distance, used as the culling distance bound.
    pub far_clip: f32,
}

impl CameraState {
    /// Builds a perspective camera looking along `forward`.
    ///
    /// Left-handed, 0..1 depth (wgpu convention).
    #[must_use]
    pub fn perspective(
        position: Vec3,
        forward: Vec3,
        up: Vec3,
        fov_y_radians: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let view = Mat4::look_to_lh(position, forward, up);
        let projection = Mat4::perspective_lh(fov_y_radians, aspect, near, far);
        Self::from_matrices(view, projection, far)
    }

    /// Builds camera state from view and projection matrices.
    #[must_use]
    pub fn from_matrices(view: Mat4, projection: Mat4, far_clip: f32) -> Self {
        let view_projection = projection * view;
        Self {
            frustum: Frustum::from_view_projection(&view_projection),
            view_projection,
            local_to_world: view.inverse(),
            far_clip,
        }
    }

    /// World-space camera position.
    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.local_to_world.w_axis.truncate()
    }
}

/// Source of the active camera.
///
/// Returning `None` means there is no camera this frame; the culler then
/// stays (or becomes) uninitialized and skips the frame.
pub trait CameraProvider {
    /// Returns the active camera, if any.
    fn active_camera(&self) -> Option<CameraState>;
}

impl CameraProvider for CameraState {
    fn active_camera(&self) -> Option<CameraState> {
        Some(*self)
    }
}

impl CameraProvider for Option<CameraState> {
    fn active_camera(&self) -> Option<CameraState> {
        *self
    }
}

/// Provider for hosts without a camera.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCamera;

impl CameraProvider for NoCamera {
    fn active_camera(&self) -> Option<CameraState> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_from_local_to_world() {
        let camera = CameraState::perspective(
            Vec3::new(5.0, 2.0, -3.0),
            Vec3::Z,
            Vec3::Y,
            1.0,
            1.0,
            0.1,
            100.0,
        );
        let position = camera.position();
        assert!((position - Vec3::new(5.0, 2.0, -3.0)).length() < 1e-4);
        assert!((camera.far_clip - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_providers() {
        assert!(NoCamera.active_camera().is_none());
        let none: Option<CameraState> = None;
        assert!(none.active_camera().is_none());

        let camera = CameraState::perspective(Vec3::ZERO, Vec3::Z, Vec3::Y, 1.0, 1.0, 0.1, 10.0);
        assert_eq!(camera.active_camera(), Some(camera));
    }
}
