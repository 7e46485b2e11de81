//! Culler orchestration.
//!
//! [`InstancedCuller`] owns a backend, a configuration and, while ready, the
//! [`CullingResources`]. Each frame it records reset, dispatch, counter copy
//! and draw into one [`CommandStream`] and submits it once.
//!
//! ```text
//!  Uninitialized ──initialize──► Ready ──run_frame──► Culling ──► Drawing
//!        ▲                         ▲                                  │
//!        └──────── release ────────┴──────────────────────────────────┘
//! ```

mod lifecycle;
mod stats;

pub use lifecycle::{CullingResources, Requirements};
pub use stats::CullStats;

use std::time::Instant;

use crate::backend::{CommandStream, FrameCommand, GpuBackend};
use crate::config::CullerConfig;
use crate::culling::{CameraProvider, CullingParameters};
use crate::error::{CullError, CullResult, Requirement};
use crate::instancing::INSTANCE_COUNT_OFFSET;

/// WGSL source of the unlit instanced material.
pub const RENDER_SHADER_SOURCE: &str = include_str!("../../shaders/instanced_unlit.wgsl");

/// Lifecycle state of a culler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullerState {
    /// No buffers held.
    #[default]
    Uninitialized,
    /// Buffers held, waiting for a frame.
    Ready,
    /// Recording the culling dispatch.
    Culling,
    /// Recording the indirect draw.
    Drawing,
}

/// Result of [`InstancedCuller::run_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The frame was submitted.
    Drawn {
        /// Workgroups dispatched.
        groups: u32,
    },
    /// Nothing was submitted.
    Skipped {
        /// Why the frame could not run.
        reason: CullError,
    },
}

impl FrameOutcome {
    /// Returns true if the frame was submitted.
    #[must_use]
    pub const fn is_drawn(&self) -> bool {
        matches!(self, Self::Drawn { .. })
    }
}

/// GPU-driven frustum culler for one instanced mesh.
pub struct InstancedCuller<B: GpuBackend> {
    backend: B,
    config: CullerConfig,
    resources: Option<CullingResources>,
    state: CullerState,
    stats: CullStats,
}

impl<B: GpuBackend> InstancedCuller<B> {
    /// Creates an uninitialized culler.
    #[must_use]
    pub fn new(backend: B, config: CullerConfig) -> Self {
        Self {
            backend,
            config,
            resources: None,
            state: CullerState::Uninitialized,
            stats: CullStats::default(),
        }
    }

    /// Validates the configuration and acquires every device resource.
    ///
    /// Buffers held from a previous initialization are released first, so
    /// calling this twice is safe. On error the culler is left
    /// uninitialized with no buffers allocated.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequirement`, `InvalidConfig`, `AllocationFailed`,
    /// `EntryPointNotFound` or a binding error.
    pub fn initialize(&mut self, camera: &impl CameraProvider) -> CullResult<()> {
        let resources = self.acquire(camera)?;
        self.resources = Some(resources);
        self.state = CullerState::Ready;
        Ok(())
    }

    fn acquire(&mut self, camera: &impl CameraProvider) -> CullResult<CullingResources> {
        self.release();

        let requirements = Requirements::check(&self.backend, &self.config, camera)?;
        let resources = CullingResources::acquire(&mut self.backend, &requirements, &self.config)?;

        self.stats.initializations += 1;
        self.stats.instance_count = resources.pool().len();
        self.stats.groups_per_dispatch = resources.pass().groups();
        self.stats.resident_bytes = resources.resident_bytes();

        tracing::info!(
            "Culler ready: {} instances, {} workgroups, radius {:.3}",
            resources.pool().len(),
            resources.pass().groups(),
            resources.instance_radius()
        );
        Ok(resources)
    }

    /// Culls and draws one frame.
    ///
    /// If the culler is not ready it tries to initialize first; when that
    /// fails the frame is skipped and nothing is submitted. Losing the
    /// active camera while ready releases every buffer and skips the frame.
    ///
    /// # Errors
    ///
    /// Returns `Submission` if the device rejects the frame. The culler
    /// stays ready and the next frame is attempted normally.
    pub fn run_frame(&mut self, camera: &impl CameraProvider) -> CullResult<FrameOutcome> {
        // Resources are held exactly while Ready.
        let resources = match self.resources.take() {
            Some(resources) => resources,
            None => match self.acquire(camera) {
                Ok(resources) => resources,
                Err(reason) => return Ok(self.skip(reason)),
            },
        };

        let Some(camera_state) = camera.active_camera() else {
            self.resources = Some(resources);
            self.release();
            return Ok(self.skip(CullError::MissingRequirement(Requirement::ActiveCamera)));
        };

        let started = Instant::now();
        let parameters = CullingParameters::from_camera(&camera_state, resources.instance_radius());
        let mut stream = CommandStream::new();

        self.state = CullerState::Culling;
        resources.surface().reset_count(&mut stream);
        resources.pass().record(&mut stream, &parameters);
        resources
            .surface()
            .copy_count_into(&mut stream, resources.arguments().buffer(), INSTANCE_COUNT_OFFSET);

        self.state = CullerState::Drawing;
        stream.push(FrameCommand::DrawIndexedIndirect {
            mesh: resources.mesh().mesh,
            material: resources.material(),
            arguments: resources.arguments().buffer(),
            view_projection: camera_state.view_projection.to_cols_array_2d(),
        });
        let groups = resources.pass().groups();
        self.resources = Some(resources);

        let submitted = self.backend.submit(&stream);
        self.state = CullerState::Ready;
        self.stats.last_frame_cpu = started.elapsed();

        match submitted {
            Ok(()) => {
                self.stats.frames_drawn += 1;
                tracing::trace!("Frame {} submitted: {} groups", self.stats.frames_drawn, groups);
                Ok(FrameOutcome::Drawn { groups })
            }
            Err(error) => {
                self.stats.submission_failures += 1;
                tracing::warn!("Frame submission failed: {}", error);
                Err(error)
            }
        }
    }

    fn skip(&mut self, reason: CullError) -> FrameOutcome {
        self.stats.frames_skipped += 1;
        tracing::debug!("Frame skipped: {}", reason);
        FrameOutcome::Skipped { reason }
    }

    /// Frees every buffer and returns to uninitialized. No-op when nothing
    /// is held.
    pub fn release(&mut self) {
        if let Some(resources) = self.resources.take() {
            resources.release(&mut self.backend);
            self.stats.releases += 1;
            self.stats.resident_bytes = 0;
            tracing::info!("Culler released");
        }
        self.state = CullerState::Uninitialized;
    }

    /// Applies a new configuration.
    ///
    /// An identical configuration is a no-op and returns `Ok(false)`.
    /// Otherwise the culler is released and reinitialized.
    ///
    /// # Errors
    ///
    /// Returns the initialization error; the culler stays uninitialized and
    /// the next frame retries.
    pub fn reconfigure(&mut self, config: CullerConfig, camera: &impl CameraProvider) -> CullResult<bool> {
        if config == self.config {
            return Ok(false);
        }
        self.config = config;
        self.release();
        self.initialize(camera)?;
        Ok(true)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> CullerState {
        self.state
    }

    /// Returns true when buffers are held and frames can be submitted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == CullerState::Ready
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &CullerConfig {
        &self.config
    }

    /// Statistics so far.
    #[must_use]
    pub const fn stats(&self) -> &CullStats {
        &self.stats
    }

    /// Held resources, if ready.
    #[must_use]
    pub const fn resources(&self) -> Option<&CullingResources> {
        self.resources.as_ref()
    }

    /// The backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    ///
    /// Releasing buffers the culler holds through this is a contract
    /// violation; later frames then fail with `InvalidBuffer`.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: GpuBackend> Drop for InstancedCuller<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B: GpuBackend + std::fmt::Debug> std::fmt::Debug for InstancedCuller<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancedCuller")
            .field("backend", &self.backend)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::culling::{CameraState, NoCamera};
    use crate::mesh::MeshGeometry;
    use glam::Vec3;

    fn camera() -> CameraState {
        CameraState::perspective(Vec3::new(0.0, 10.0, -80.0), Vec3::Z, Vec3::Y, 1.0, 1.5, 0.3, 200.0)
    }

    fn culler(count: u32) -> InstancedCuller<SoftwareBackend> {
        let mut backend = SoftwareBackend::new();
        let mesh = backend.upload_mesh(&MeshGeometry::cube(0.5));
        let material = backend.load_material();
        let program = backend.load_culling_program();
        let config = CullerConfig::default()
            .with_mesh(mesh)
            .with_material(material)
            .with_program(program)
            .with_instance_count(count);
        InstancedCuller::new(backend, config)
    }

    #[test]
    fn test_starts_uninitialized() {
        let culler = culler(10);
        assert_eq!(culler.state(), CullerState::Uninitialized);
        assert!(culler.resources().is_none());
        assert_eq!(culler.backend().live_buffer_count(), 0);
    }

    #[test]
    fn test_frame_initializes_lazily() {
        let mut culler = culler(1000);
        let outcome = culler.run_frame(&camera()).unwrap();

        assert_eq!(outcome, FrameOutcome::Drawn { groups: 16 });
        assert!(culler.is_ready());
        assert_eq!(culler.stats().initializations, 1);
        assert_eq!(culler.stats().frames_drawn, 1);
        assert_eq!(culler.backend().draw_count(), 1);
    }

    #[test]
    fn test_skips_without_camera() {
        let mut culler = culler(10);
        let outcome = culler.run_frame(&NoCamera).unwrap();

        assert_eq!(
            outcome,
            FrameOutcome::Skipped {
                reason: CullError::MissingRequirement(Requirement::ActiveCamera)
            }
        );
        assert!(!culler.is_ready());
        assert_eq!(culler.backend().submission_count(), 0);
        assert_eq!(culler.stats().frames_skipped, 1);
    }

    #[test]
    fn test_losing_camera_releases() {
        let mut culler = culler(100);
        assert!(culler.run_frame(&camera()).unwrap().is_drawn());
        assert_eq!(culler.backend().live_buffer_count(), 3);

        let outcome = culler.run_frame(&NoCamera).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Skipped {
                reason: CullError::MissingRequirement(Requirement::ActiveCamera)
            }
        );
        assert_eq!(culler.state(), CullerState::Uninitialized);
        assert!(culler.resources().is_none());
        assert_eq!(culler.backend().live_buffer_count(), 0);
        assert_eq!(culler.backend().draw_count(), 1);

        assert!(culler.run_frame(&camera()).unwrap().is_drawn());
        assert_eq!(culler.stats().initializations, 2);
    }

    #[test]
    fn test_only_latest_draw_is_kept() {
        let mut culler = culler(500);
        for _ in 0..4 {
            culler.run_frame(&camera()).unwrap();
        }
        assert_eq!(culler.backend().draw_count(), 4);
        let draw = culler.backend().last_draw().unwrap();
        assert_eq!(draw.instances.len(), draw.arguments.instance_count as usize);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut culler = culler(10);
        culler.initialize(&camera()).unwrap();
        assert_eq!(culler.backend().live_buffer_count(), 3);

        culler.release();
        culler.release();
        assert_eq!(culler.state(), CullerState::Uninitialized);
        assert_eq!(culler.backend().live_buffer_count(), 0);
        assert_eq!(culler.stats().releases, 1);
    }

    #[test]
    fn test_reconfigure_same_config_is_noop() {
        let mut culler = culler(10);
        culler.initialize(&camera()).unwrap();
        let config = culler.config().clone();

        assert!(!culler.reconfigure(config.clone(), &camera()).unwrap());
        assert_eq!(culler.stats().initializations, 1);

        assert!(culler.reconfigure(config.with_instance_count(20), &camera()).unwrap());
        assert_eq!(culler.stats().initializations, 2);
        assert_eq!(culler.resources().map(|r| r.pool().len()), Some(20));
    }
}
