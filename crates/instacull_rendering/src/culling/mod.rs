//! Culling systems for GPU-driven rendering.
//!
//! Frustum extraction, camera snapshots and the compute pass that compacts
//! the visible instance set on the device.

mod camera;
mod frustum;
mod pass;

pub use camera::{CameraProvider, CameraState, NoCamera};
pub use frustum::{Frustum, Plane};
pub use pass::{
    classify, group_count, Classification, CullingParameters, CullingPass, CullingUniforms,
    CULL_KERNEL_NAME, CULL_SHADER_SOURCE, MAX_DISPATCH_GROUPS, THREAD_GROUP_SIZE,
};
