//! The culling compute pass.
//!
//! Every instance is classified independently against the six frustum
//! planes (inflated by the instance radius) and the camera distance bound.
//! Survivors are appended to the visibility surface.
//!
//! [`classify`] is the reference rule; `shaders/cull_instances.wgsl` is its
//! device twin and must stay in lockstep with it.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use super::camera::CameraState;
use super::frustum::Frustum;
use crate::backend::{
    CommandStream, FrameCommand, GpuBackend, KernelId, ProgramId, ALL_INSTANCES_BINDING,
    VISIBLE_INSTANCES_BINDING,
};
use crate::error::{CullError, CullResult};
use crate::instancing::{InstancePool, VisibilitySurface};

/// Threads per workgroup of the culling kernel.
pub const THREAD_GROUP_SIZE: u32 = 64;

/// Entry point name of the culling kernel.
pub const CULL_KERNEL_NAME: &str = "CullInstances";

/// Largest workgroup count a single dispatch dimension may use.
pub const MAX_DISPATCH_GROUPS: u32 = 65_535;

/// WGSL source of the culling kernel.
pub const CULL_SHADER_SOURCE: &str = include_str!("../../shaders/cull_instances.wgsl");

/// Per-frame culling inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullingParameters {
    /// World-space frustum.
    pub frustum: Frustum,
    /// Instances at or beyond this distance from the camera are culled.
    pub max_distance: f32,
    /// Camera transform; its translation is the distance origin.
    pub camera_local_to_world: Mat4,
    /// Bounding-sphere radius applied to every instance.
    pub instance_radius: f32,
}

impl CullingParameters {
    /// Builds parameters from a camera, using its far clip as distance bound.
    #[must_use]
    pub fn from_camera(camera: &CameraState, instance_radius: f32) -> Self {
        Self {
            frustum: camera.frustum,
            max_distance: camera.far_clip,
            camera_local_to_world: camera.local_to_world,
            instance_radius,
        }
    }

    /// Packs the parameters for GPU upload.
    #[must_use]
    pub fn to_uniforms(&self) -> CullingUniforms {
        CullingUniforms {
            frustum_planes: self.frustum.as_arrays(),
            camera_local_to_world: self.camera_local_to_world.to_cols_array_2d(),
            max_distance: self.max_distance,
            instance_radius: self.instance_radius,
            _pad: [0.0; 2],
        }
    }
}

/// GPU image of [`CullingParameters`].
///
/// Layout matches `CullingUniforms` in `cull_instances.wgsl` (176 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CullingUniforms {
    /// `_FrustumPlanes`: xyz = inward normal, w = distance.
    pub frustum_planes: [[f32; 4]; 6],
    /// `_CameraLocalToWorld`, column major.
    pub camera_local_to_world: [[f32; 4]; 4],
    /// `_MaxDistance`.
    pub max_distance: f32,
    /// `_InstanceRadius`.
    pub instance_radius: f32,
    /// Padding to 16-byte alignment.
    pub _pad: [f32; 2],
}

impl CullingUniforms {
    /// Camera position encoded in the local-to-world matrix.
    #[must_use]
    pub fn camera_position(&self) -> Vec3 {
        Mat4::from_cols_array_2d(&self.camera_local_to_world)
            .w_axis
            .truncate()
    }
}

/// Outcome of classifying one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Inside all planes and within the distance bound.
    Visible,
    /// Outside the half-space of the plane with this index.
    OutsidePlane(usize),
    /// Inside the frustum but too far from the camera.
    BeyondDistance,
}

impl Classification {
    /// Returns true for [`Classification::Visible`].
    #[must_use]
    pub const fn is_visible(self) -> bool {
        matches!(self, Self::Visible)
    }
}

/// Classifies one instance position.
#[must_use]
pub fn classify(uniforms: &CullingUniforms, position: Vec3) -> Classification {
    for (index, plane) in uniforms.frustum_planes.iter().enumerate() {
        let normal = Vec3::new(plane[0], plane[1], plane[2]);
        if normal.dot(position) + plane[3] < -uniforms.instance_radius {
            return Classification::OutsidePlane(index);
        }
    }

    if position.distance(uniforms.camera_position()) >= uniforms.max_distance {
        return Classification::BeyondDistance;
    }

    Classification::Visible
}

/// Number of workgroups needed to cover `instance_count` threads.
#[must_use]
pub const fn group_count(instance_count: u32) -> u32 {
    instance_count.div_ceil(THREAD_GROUP_SIZE)
}

/// Resolved culling kernel bound to one pool/surface pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullingPass {
    kernel: KernelId,
    instance_count: u32,
}

impl CullingPass {
    /// Resolves `CullInstances` and binds the pool and surface to it.
    ///
    /// # Errors
    ///
    /// Returns `EntryPointNotFound` if the program lacks the kernel, or a
    /// binding error from the backend.
    pub fn resolve<B: GpuBackend>(
        backend: &mut B,
        program: ProgramId,
        pool: &InstancePool,
        surface: &VisibilitySurface,
    ) -> CullResult<Self> {
        let groups = group_count(pool.len());
        if groups > MAX_DISPATCH_GROUPS {
            return Err(CullError::InvalidConfig(format!(
                "{} instances need {groups} workgroups, limit is {MAX_DISPATCH_GROUPS}",
                pool.len()
            )));
        }

        let kernel = backend.find_kernel(program, CULL_KERNEL_NAME)?;
        backend.bind_kernel_buffer(kernel, ALL_INSTANCES_BINDING, pool.buffer())?;
        backend.bind_kernel_buffer(kernel, VISIBLE_INSTANCES_BINDING, surface.buffer())?;

        Ok(Self {
            kernel,
            instance_count: pool.len(),
        })
    }

    /// Resolved kernel handle.
    #[must_use]
    pub const fn kernel(&self) -> KernelId {
        self.kernel
    }

    /// Workgroups dispatched per frame.
    #[must_use]
    pub const fn groups(&self) -> u32 {
        group_count(self.instance_count)
    }

    /// Records the dispatch into a frame's command stream.
    pub fn record(&self, stream: &mut CommandStream, parameters: &CullingParameters) {
        stream.push(FrameCommand::Dispatch {
            kernel: self.kernel,
            uniforms: parameters.to_uniforms(),
            groups: [self.groups(), 1, 1],
        });
    }
}
