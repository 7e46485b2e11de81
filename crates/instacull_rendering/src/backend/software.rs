//! CPU device.
//!
//! Executes the same command streams as the `wgpu` backend, with the culling
//! kernel evaluated by [`classify`] across worker threads. Append semantics
//! match the device: survivors claim slots through an atomic counter, so the
//! order of the visible set is unspecified.
//!
//! Fault injection hooks (allocation budget, failing submissions, missing
//! compute support) make every error path of the culler reachable in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::{
    BufferDesc, BufferId, BufferKind, CommandStream, FrameCommand, GpuBackend, KernelId, MaterialId,
    MeshId, ProgramId, ALL_INSTANCES_BINDING, VISIBLE_INSTANCES_BINDING,
};
use crate::culling::{classify, CullingUniforms, CULL_KERNEL_NAME, THREAD_GROUP_SIZE};
use crate::error::{CullError, CullResult};
use crate::instancing::{DrawArguments, InstanceRecord};
use crate::mesh::{MeshDesc, MeshGeometry};

/// Words per instance record.
const RECORD_WORDS: usize = InstanceRecord::SIZE / 4;

/// Below this many threads a dispatch runs on the calling thread.
const PARALLEL_THRESHOLD: usize = 4096;

/// Default largest buffer, same as the `wgpu` default limit.
const DEFAULT_MAX_BUFFER_SIZE: u64 = 256 << 20;

/// One executed indirect draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    /// Mesh drawn.
    pub mesh: MeshId,
    /// Material used.
    pub material: MaterialId,
    /// Arguments as read from the indirect buffer at draw time.
    pub arguments: DrawArguments,
    /// Instances the material read, in slot order.
    pub instances: Vec<InstanceRecord>,
    /// View-projection handed to the material.
    pub view_projection: [[f32; 4]; 4],
}

#[derive(Debug)]
struct SoftwareBuffer {
    desc: BufferDesc,
    words: Vec<u32>,
    counter: Option<u32>,
}

#[derive(Debug)]
struct SoftwareKernel {
    program: ProgramId,
    entry_point: String,
    bindings: HashMap<&'static str, BufferId>,
}

#[derive(Debug, Default)]
struct SoftwareMaterial {
    bindings: HashMap<&'static str, BufferId>,
}

/// CPU implementation of [`GpuBackend`].
#[derive(Debug)]
pub struct SoftwareBackend {
    next_handle: u32,
    buffers: HashMap<BufferId, SoftwareBuffer>,
    programs: HashMap<ProgramId, Vec<String>>,
    kernels: HashMap<KernelId, SoftwareKernel>,
    materials: HashMap<MaterialId, SoftwareMaterial>,
    meshes: HashMap<MeshId, MeshGeometry>,
    compute_supported: bool,
    max_buffer_size: u64,
    allocation_budget: Option<u32>,
    fail_next_submit: bool,
    worker_threads: usize,
    submissions: u64,
    last_submission: Vec<FrameCommand>,
    draw_count: u64,
    last_draw: Option<DrawRecord>,
}

impl SoftwareBackend {
    /// Creates a backend with compute support and no faults armed.
    #[must_use]
    pub fn new() -> Self {
        let worker_threads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            next_handle: 1,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            materials: HashMap::new(),
            meshes: HashMap::new(),
            compute_supported: true,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            allocation_budget: None,
            fail_next_submit: false,
            worker_threads,
            submissions: 0,
            last_submission: Vec::new(),
            draw_count: 0,
            last_draw: None,
        }
    }

    fn next_raw(&mut self) -> u32 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a compute program exporting `entry_points`.
    pub fn load_program(&mut self, entry_points: &[&str]) -> ProgramId {
        let id = ProgramId::new(self.next_raw());
        self.programs
            .insert(id, entry_points.iter().map(|name| (*name).to_owned()).collect());
        id
    }

    /// Registers a program exporting the culling kernel.
    pub fn load_culling_program(&mut self) -> ProgramId {
        self.load_program(&[CULL_KERNEL_NAME])
    }

    /// Registers a render material with no bindings.
    pub fn load_material(&mut self) -> MaterialId {
        let id = MaterialId::new(self.next_raw());
        self.materials.insert(id, SoftwareMaterial::default());
        id
    }

    /// Registers mesh geometry and describes its whole range as submesh 0.
    pub fn upload_mesh(&mut self, geometry: &MeshGeometry) -> MeshDesc {
        let mesh = MeshId::new(self.next_raw());
        let desc = MeshDesc {
            mesh,
            bounds_extents: geometry.bounds_extents,
            submesh: geometry.full_range(),
        };
        self.meshes.insert(mesh, geometry.clone());
        desc
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Toggles compute shader support.
    pub fn set_compute_supported(&mut self, supported: bool) {
        self.compute_supported = supported;
    }

    /// Lets `count` more allocations succeed, then fails every later one.
    /// `None` removes the limit.
    pub fn set_allocation_budget(&mut self, count: Option<u32>) {
        self.allocation_budget = count;
    }

    /// Largest buffer the device accepts.
    pub fn set_max_buffer_size(&mut self, bytes: u64) {
        self.max_buffer_size = bytes;
    }

    /// Makes the next [`GpuBackend::submit`] fail without executing anything.
    pub fn fail_next_submit(&mut self) {
        self.fail_next_submit = true;
    }

    /// Number of threads a dispatch may use.
    pub fn set_worker_threads(&mut self, threads: usize) {
        self.worker_threads = threads.max(1);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Raw contents of a live buffer.
    #[must_use]
    pub fn buffer_words(&self, buffer: BufferId) -> Option<&[u32]> {
        self.buffers.get(&buffer).map(|b| b.words.as_slice())
    }

    /// Contents of a live buffer viewed as instance records.
    #[must_use]
    pub fn buffer_records(&self, buffer: BufferId) -> Option<&[InstanceRecord]> {
        self.buffer_words(buffer)
            .and_then(|words| bytemuck::try_cast_slice(words).ok())
    }

    /// Draw arguments stored in an indirect argument buffer.
    #[must_use]
    pub fn draw_arguments(&self, buffer: BufferId) -> Option<DrawArguments> {
        let words = self.buffer_words(buffer)?;
        let words: &[u32; 5] = words.get(..5)?.try_into().ok()?;
        Some(bytemuck::cast(*words))
    }

    /// Live counter of an append buffer.
    #[must_use]
    pub fn counter_value(&self, buffer: BufferId) -> Option<u32> {
        self.buffers.get(&buffer).and_then(|b| b.counter)
    }

    /// Number of buffers not yet released.
    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of draws executed so far.
    #[must_use]
    pub const fn draw_count(&self) -> u64 {
        self.draw_count
    }

    /// Most recent draw. Only the latest one is kept.
    #[must_use]
    pub fn last_draw(&self) -> Option<&DrawRecord> {
        self.last_draw.as_ref()
    }

    /// Commands of the most recent successful submission.
    #[must_use]
    pub fn last_submission(&self) -> &[FrameCommand] {
        &self.last_submission
    }

    /// Number of successful submissions.
    #[must_use]
    pub const fn submission_count(&self) -> u64 {
        self.submissions
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn buffer(&self, id: BufferId) -> CullResult<&SoftwareBuffer> {
        self.buffers.get(&id).ok_or(CullError::InvalidBuffer(id))
    }

    fn buffer_mut(&mut self, id: BufferId) -> CullResult<&mut SoftwareBuffer> {
        self.buffers.get_mut(&id).ok_or(CullError::InvalidBuffer(id))
    }

    fn execute(&mut self, command: &FrameCommand) -> CullResult<()> {
        match *command {
            FrameCommand::ResetCounter { buffer } => {
                let target = self.buffer_mut(buffer)?;
                match target.counter.as_mut() {
                    Some(counter) => {
                        *counter = 0;
                        Ok(())
                    }
                    None => Err(CullError::Submission(format!(
                        "{} has no counter",
                        target.desc.label
                    ))),
                }
            }
            FrameCommand::Dispatch {
                kernel,
                uniforms,
                groups,
            } => self.dispatch(kernel, &uniforms, groups),
            FrameCommand::CopyCounter {
                source,
                target,
                offset_bytes,
            } => {
                let source_buffer = self.buffer(source)?;
                let count = source_buffer.counter.ok_or_else(|| {
                    CullError::Submission(format!("{} has no counter", source_buffer.desc.label))
                })?;
                let target_buffer = self.buffer_mut(target)?;
                if offset_bytes % 4 != 0 || offset_bytes + 4 > target_buffer.desc.size_bytes() {
                    return Err(CullError::Submission(format!(
                        "counter copy to offset {offset_bytes} of {}",
                        target_buffer.desc.label
                    )));
                }
                target_buffer.words[(offset_bytes / 4) as usize] = count;
                Ok(())
            }
            FrameCommand::DrawIndexedIndirect {
                mesh,
                material,
                arguments,
                view_projection,
            } => self.draw(mesh, material, arguments, view_projection),
        }
    }

    fn dispatch(&mut self, kernel: KernelId, uniforms: &CullingUniforms, groups: [u32; 3]) -> CullResult<()> {
        let kernel_state = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| CullError::InvalidHandle(format!("kernel {}", kernel.raw())))?;
        if kernel_state.entry_point != CULL_KERNEL_NAME {
            return Err(CullError::Submission(format!(
                "no software implementation for {}",
                kernel_state.entry_point
            )));
        }
        let binding = |name: &str| {
            kernel_state
                .bindings
                .get(name)
                .copied()
                .ok_or_else(|| CullError::Submission(format!("{name} is not bound")))
        };
        let input_id = binding(ALL_INSTANCES_BINDING)?;
        let output_id = binding(VISIBLE_INSTANCES_BINDING)?;
        if input_id == output_id {
            return Err(CullError::Submission("input and output alias".into()));
        }

        let threads = groups.iter().map(|&g| g as usize).product::<usize>() * THREAD_GROUP_SIZE as usize;

        // Take the output out of the map so the input can be borrowed alongside it.
        let mut output = self.buffers.remove(&output_id).ok_or(CullError::InvalidBuffer(output_id))?;
        let result = self.cull_into(&mut output, input_id, uniforms, threads);
        self.buffers.insert(output_id, output);
        result
    }

    fn cull_into(
        &self,
        output: &mut SoftwareBuffer,
        input_id: BufferId,
        uniforms: &CullingUniforms,
        threads: usize,
    ) -> CullResult<()> {
        let input = self.buffer(input_id)?;
        let start = output.counter.ok_or_else(|| {
            CullError::Submission(format!("{} has no counter", output.desc.label))
        })?;
        let records: &[InstanceRecord] = bytemuck::try_cast_slice(&input.words)
            .map_err(|e| CullError::Submission(format!("instance buffer layout: {e}")))?;

        let limit = threads.min(records.len());
        let count = run_cull_kernel(
            uniforms,
            &records[..limit],
            &mut output.words,
            start,
            self.worker_threads,
        );
        output.counter = Some(count);
        Ok(())
    }

    fn draw(
        &mut self,
        mesh: MeshId,
        material: MaterialId,
        arguments: BufferId,
        view_projection: [[f32; 4]; 4],
    ) -> CullResult<()> {
        if !self.meshes.contains_key(&mesh) {
            return Err(CullError::InvalidHandle(format!("mesh {}", mesh.raw())));
        }
        let material_state = self
            .materials
            .get(&material)
            .ok_or_else(|| CullError::InvalidHandle(format!("material {}", material.raw())))?;
        let args = self.draw_arguments(arguments).ok_or(CullError::InvalidBuffer(arguments))?;

        let instances = match material_state.bindings.get(VISIBLE_INSTANCES_BINDING) {
            Some(&source) => {
                let records = self.buffer_records(source).ok_or(CullError::InvalidBuffer(source))?;
                let start = args.start_instance as usize;
                let end = (start + args.instance_count as usize).min(records.len());
                records.get(start..end).map(<[InstanceRecord]>::to_vec).unwrap_or_default()
            }
            None => {
                return Err(CullError::Submission(format!(
                    "{VISIBLE_INSTANCES_BINDING} is not bound on material {}",
                    material.raw()
                )))
            }
        };

        self.draw_count += 1;
        self.last_draw = Some(DrawRecord {
            mesh,
            material,
            arguments: args,
            instances,
            view_projection,
        });
        Ok(())
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends every visible record to `output` starting at counter `start`.
/// Returns the final counter value.
fn run_cull_kernel(
    uniforms: &CullingUniforms,
    records: &[InstanceRecord],
    output: &mut [u32],
    start: u32,
    worker_threads: usize,
) -> u32 {
    let counter = AtomicU32::new(start);
    let capacity = output.len() / RECORD_WORDS;
    let output = Mutex::new(output);

    let cull = |chunk: &[InstanceRecord]| {
        for record in chunk {
            if !classify(uniforms, record.world_position()).is_visible() {
                continue;
            }
            let slot = counter.fetch_add(1, Ordering::Relaxed) as usize;
            if slot < capacity {
                let words: &[u32; RECORD_WORDS] = bytemuck::cast_ref(record);
                let mut output = output.lock();
                output[slot * RECORD_WORDS..(slot + 1) * RECORD_WORDS].copy_from_slice(words);
            }
        }
    };

    if worker_threads <= 1 || records.len() < PARALLEL_THRESHOLD {
        cull(records);
    } else {
        let chunk_size = records.len().div_ceil(worker_threads);
        let cull = &cull;
        std::thread::scope(|scope| {
            for chunk in records.chunks(chunk_size) {
                scope.spawn(move || cull(chunk));
            }
        });
    }

    counter.into_inner()
}

impl GpuBackend for SoftwareBackend {
    fn supports_compute(&self) -> bool {
        self.compute_supported
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> CullResult<BufferId> {
        let size = desc.size_bytes();
        let failed = CullError::AllocationFailed {
            label: desc.label,
            size,
        };

        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(failed);
            }
            *budget -= 1;
        }
        if size > self.max_buffer_size || desc.stride % 4 != 0 {
            return Err(failed);
        }

        let mut words = vec![0u32; (size / 4) as usize];
        if let Some(bytes) = contents {
            if bytes.len() as u64 != size {
                return Err(CullError::InvalidConfig(format!(
                    "{}: {} bytes of contents for a {size} byte buffer",
                    desc.label,
                    bytes.len()
                )));
            }
            for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }

        let id = BufferId::new(self.next_raw());
        self.buffers.insert(
            id,
            SoftwareBuffer {
                desc: *desc,
                words,
                counter: (desc.kind == BufferKind::Append).then_some(0),
            },
        );
        Ok(id)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_none() {
            tracing::warn!("Release of unknown buffer {}", buffer.raw());
            return;
        }
        for kernel in self.kernels.values_mut() {
            kernel.bindings.retain(|_, bound| *bound != buffer);
        }
        for material in self.materials.values_mut() {
            material.bindings.retain(|_, bound| *bound != buffer);
        }
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.desc.size_bytes())
    }

    fn find_kernel(&mut self, program: ProgramId, entry_point: &str) -> CullResult<KernelId> {
        let exports = self
            .programs
            .get(&program)
            .ok_or_else(|| CullError::InvalidHandle(format!("program {}", program.raw())))?;
        if !exports.iter().any(|name| name == entry_point) {
            return Err(CullError::EntryPointNotFound(entry_point.to_owned()));
        }

        if let Some((&id, _)) = self
            .kernels
            .iter()
            .find(|(_, k)| k.program == program && k.entry_point == entry_point)
        {
            return Ok(id);
        }
        let id = KernelId::new(self.next_raw());
        self.kernels.insert(
            id,
            SoftwareKernel {
                program,
                entry_point: entry_point.to_owned(),
                bindings: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn bind_kernel_buffer(&mut self, kernel: KernelId, name: &str, buffer: BufferId) -> CullResult<()> {
        let slot = match name {
            ALL_INSTANCES_BINDING => ALL_INSTANCES_BINDING,
            VISIBLE_INSTANCES_BINDING => VISIBLE_INSTANCES_BINDING,
            other => return Err(CullError::InvalidHandle(format!("kernel binding {other}"))),
        };
        self.buffer(buffer)?;
        let kernel_state = self
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| CullError::InvalidHandle(format!("kernel {}", kernel.raw())))?;
        kernel_state.bindings.insert(slot, buffer);
        Ok(())
    }

    fn bind_material_buffer(
        &mut self,
        material: MaterialId,
        name: &str,
        buffer: BufferId,
    ) -> CullResult<()> {
        if name != VISIBLE_INSTANCES_BINDING {
            return Err(CullError::InvalidHandle(format!("material binding {name}")));
        }
        self.buffer(buffer)?;
        let material_state = self
            .materials
            .get_mut(&material)
            .ok_or_else(|| CullError::InvalidHandle(format!("material {}", material.raw())))?;
        material_state.bindings.insert(VISIBLE_INSTANCES_BINDING, buffer);
        Ok(())
    }

    fn submit(&mut self, stream: &CommandStream) -> CullResult<()> {
        if std::mem::take(&mut self.fail_next_submit) {
            return Err(CullError::Submission("device lost".into()));
        }

        for command in stream.commands() {
            self.execute(command)?;
        }

        self.submissions += 1;
        self.last_submission = stream.commands().to_vec();
        tracing::trace!("Software submission {}: {} commands", self.submissions, stream.len());
        Ok(())
    }
}
