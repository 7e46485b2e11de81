//! # INSTACULL Rendering
//!
//! GPU-driven frustum culling for large instanced draws:
//! - Visibility of every instance decided on the device, one thread each
//! - Survivors compacted into an append buffer through an atomic counter
//! - The counter copied device-to-device into indirect draw arguments
//! - One indexed indirect draw per frame, no readback
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ONE SUBMISSION                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResetCounter → CullInstances (Compute) → CopyCounter        │
//! │       ↓                  ↓                      ↓            │
//! │  VisibilitySurface ← InstancePool        DrawArguments[1]    │
//! │       ↓                                         ↓            │
//! │  _VisibleInstancesData ──────────► DrawIndexedIndirect       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backends
//!
//! The pipeline records device work through [`GpuBackend`]. [`WgpuBackend`]
//! runs it on a GPU; [`SoftwareBackend`] runs the same commands on the CPU.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
// Sizes and counts cross between u32 (device) and usize/u64 (host) everywhere.
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

pub mod backend;
pub mod config;
pub mod culling;
pub mod error;
pub mod instancing;
pub mod mesh;
pub mod pipeline;

pub use backend::{
    BufferDesc, BufferId, BufferKind, CommandStream, DrawRecord, FrameCommand, GpuBackend, KernelId,
    MaterialId, MeshId, ProgramId, SoftwareBackend, WgpuBackend,
};
pub use config::{CullerConfig, CullerSettings};
pub use culling::{
    CameraProvider, CameraState, Classification, CullingParameters, CullingPass, CullingUniforms,
    Frustum, NoCamera, Plane,
};
pub use error::{CullError, CullResult, Requirement};
pub use instancing::{
    DrawArguments, IndirectDrawArguments, InstancePool, InstanceRecord, PopulationSource,
    VisibilitySurface,
};
pub use mesh::{IndexRange, MeshDesc, MeshGeometry};
pub use pipeline::{CullStats, CullerState, FrameOutcome, InstancedCuller};
