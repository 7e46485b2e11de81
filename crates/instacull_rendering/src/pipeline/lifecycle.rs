//! Acquisition and release of the culler's device resources.
//!
//! The pool, the visibility surface and the draw arguments are allocated
//! together and released together. If any step of acquisition fails, the
//! buffers already allocated are released before the error is returned, so
//! a failed initialization never leaks device memory.

use crate::backend::{GpuBackend, MaterialId, ProgramId, VISIBLE_INSTANCES_BINDING};
use crate::config::CullerConfig;
use crate::culling::{CameraProvider, CullingPass};
use crate::error::{CullError, CullResult, Requirement};
use crate::instancing::{IndirectDrawArguments, InstancePool, InstanceRecord, VisibilitySurface};
use crate::mesh::MeshDesc;

/// Device resources required before a frame can be configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requirements {
    /// Render mesh.
    pub mesh: MeshDesc,
    /// Render material.
    pub material: MaterialId,
    /// Culling program.
    pub program: ProgramId,
}

impl Requirements {
    /// Checks, in order: mesh, material, program, active camera, compute
    /// support, then the numeric settings.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequirement` for the first missing item, or
    /// `InvalidConfig` for out-of-range settings.
    pub fn check<B: GpuBackend>(
        backend: &B,
        config: &CullerConfig,
        camera: &impl CameraProvider,
    ) -> CullResult<Self> {
        let mesh = config
            .render_mesh
            .ok_or(CullError::MissingRequirement(Requirement::RenderMesh))?;
        let material = config
            .render_material
            .ok_or(CullError::MissingRequirement(Requirement::RenderMaterial))?;
        let program = config
            .culling_program
            .ok_or(CullError::MissingRequirement(Requirement::CullingProgram))?;
        if camera.active_camera().is_none() {
            return Err(CullError::MissingRequirement(Requirement::ActiveCamera));
        }
        if !backend.supports_compute() {
            return Err(CullError::MissingRequirement(Requirement::ComputeSupport));
        }
        config.settings().validate()?;

        Ok(Self {
            mesh,
            material,
            program,
        })
    }
}

/// The three buffers plus the resolved culling pass.
#[derive(Debug, PartialEq)]
pub struct CullingResources {
    pool: InstancePool,
    surface: VisibilitySurface,
    arguments: IndirectDrawArguments,
    pass: CullingPass,
    mesh: MeshDesc,
    material: MaterialId,
    instance_radius: f32,
}

impl CullingResources {
    /// Uploads the population, allocates the surface and arguments, resolves
    /// `CullInstances` and wires every binding.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error after releasing everything
    /// allocated so far.
    pub fn acquire<B: GpuBackend>(
        backend: &mut B,
        requirements: &Requirements,
        config: &CullerConfig,
    ) -> CullResult<Self> {
        let count = config.instance_count;
        let records: Vec<InstanceRecord> = config.population.generate(count, config.area_size)?;

        let pool = InstancePool::upload(backend, &records, count)?;

        let surface = match VisibilitySurface::allocate(backend, count) {
            Ok(surface) => surface,
            Err(error) => {
                pool.release(backend);
                return Err(error);
            }
        };

        let arguments = match IndirectDrawArguments::initialize(backend, &requirements.mesh.submesh) {
            Ok(arguments) => arguments,
            Err(error) => {
                surface.release(backend);
                pool.release(backend);
                return Err(error);
            }
        };

        let wired = CullingPass::resolve(backend, requirements.program, &pool, &surface).and_then(|pass| {
            backend.bind_material_buffer(
                requirements.material,
                VISIBLE_INSTANCES_BINDING,
                surface.buffer(),
            )?;
            Ok(pass)
        });
        let pass = match wired {
            Ok(pass) => pass,
            Err(error) => {
                arguments.release(backend);
                surface.release(backend);
                pool.release(backend);
                return Err(error);
            }
        };

        Ok(Self {
            pool,
            surface,
            arguments,
            pass,
            mesh: requirements.mesh,
            material: requirements.material,
            instance_radius: requirements.mesh.instance_radius(config.radius_multiplier),
        })
    }

    /// Frees all three buffers.
    pub fn release<B: GpuBackend>(self, backend: &mut B) {
        self.arguments.release(backend);
        self.surface.release(backend);
        self.pool.release(backend);
    }

    /// Instance pool.
    #[must_use]
    pub const fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Visibility surface.
    #[must_use]
    pub const fn surface(&self) -> &VisibilitySurface {
        &self.surface
    }

    /// Indirect draw arguments.
    #[must_use]
    pub const fn arguments(&self) -> &IndirectDrawArguments {
        &self.arguments
    }

    /// Resolved culling pass.
    #[must_use]
    pub const fn pass(&self) -> &CullingPass {
        &self.pass
    }

    /// Mesh drawn each frame.
    #[must_use]
    pub const fn mesh(&self) -> &MeshDesc {
        &self.mesh
    }

    /// Material drawn with.
    #[must_use]
    pub const fn material(&self) -> MaterialId {
        self.material
    }

    /// Bounding-sphere radius used by the culling pass.
    #[must_use]
    pub const fn instance_radius(&self) -> f32 {
        self.instance_radius
    }

    /// Device memory held by the three buffers.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        let records = u64::from(self.pool.len()) * InstanceRecord::SIZE as u64;
        let surface = u64::from(self.surface.capacity()) * InstanceRecord::SIZE as u64;
        records + surface + crate::instancing::DrawArguments::SIZE as u64
    }
}
