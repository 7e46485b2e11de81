//! `wgpu` device.
//!
//! Programs and materials are WGSL modules. Their binding slots are resolved
//! by name from the `@binding(n) var ... name` declarations, so the culler can
//! bind `_AllInstancesData` / `_VisibleInstancesData` without knowing slot
//! numbers. Each [`CommandStream`] becomes one command encoder and one queue
//! submission; `wgpu` executes submissions on a queue in order, which is what
//! lets the culler reuse one set of buffers every frame.
//!
//! Append buffers are a storage array plus a separate 4-byte counter buffer.
//! The counter is bound to `<name>Count` next to the array, cleared with
//! `clear_buffer` and moved into the draw arguments with
//! `copy_buffer_to_buffer`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{mpsc, Arc};

use wgpu::util::DeviceExt;

use super::{
    BufferDesc, BufferId, BufferKind, CommandStream, FrameCommand, GpuBackend, KernelId, MaterialId,
    MeshId, ProgramId, COUNTER_BINDING_SUFFIX,
};
use crate::culling::CullingUniforms;
use crate::error::{CullError, CullResult};
use crate::instancing::DrawArguments;
use crate::mesh::{MeshDesc, MeshGeometry, MeshVertex};

/// Color target format of the offscreen frame.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Depth target format.
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Size of the material camera uniform (one column-major `mat4x4<f32>`).
const CAMERA_UNIFORM_SIZE: u64 = 64;

const COUNTER_SIZE: u64 = 4;

// ============================================================================
// SHADER LAYOUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShaderStage {
    Compute,
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShaderBinding {
    name: String,
    index: u32,
    uniform: bool,
}

/// Entry points and group-0 bindings declared by a WGSL module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ShaderLayout {
    entry_points: Vec<(ShaderStage, String)>,
    bindings: Vec<ShaderBinding>,
}

impl ShaderLayout {
    fn scan(source: &str) -> Self {
        let mut layout = Self::default();
        let mut pending_stage = None;

        for line in source.lines() {
            let line = line.split("//").next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            if let Some(binding) = parse_binding(line) {
                layout.bindings.push(binding);
                continue;
            }
            for (attribute, stage) in [
                ("@compute", ShaderStage::Compute),
                ("@vertex", ShaderStage::Vertex),
                ("@fragment", ShaderStage::Fragment),
            ] {
                if line.contains(attribute) {
                    pending_stage = Some(stage);
                }
            }
            if let (Some(stage), Some(name)) = (pending_stage, parse_fn_name(line)) {
                layout.entry_points.push((stage, name));
                pending_stage = None;
            }
        }

        layout
    }

    fn entry_point(&self, stage: ShaderStage) -> Option<&str> {
        self.entry_points
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, name)| name.as_str())
    }

    fn has_entry_point(&self, stage: ShaderStage, name: &str) -> bool {
        self.entry_points.iter().any(|(s, n)| *s == stage && n == name)
    }

    fn binding(&self, name: &str) -> Option<&ShaderBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }
}

fn parse_fn_name(line: &str) -> Option<String> {
    let rest = line.split_once("fn ")?.1;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

fn parse_binding(line: &str) -> Option<ShaderBinding> {
    let rest = line.split_once("@binding(")?.1;
    let (index, rest) = rest.split_once(')')?;
    let index = index.trim().parse().ok()?;
    let rest = rest.split_once("var")?.1;
    let uniform = rest.starts_with("<uniform>");
    let rest = match rest.strip_prefix('<') {
        Some(qualified) => qualified.split_once('>')?.1,
        None => rest,
    };
    let name = rest.split(':').next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(ShaderBinding {
        name: name.to_owned(),
        index,
        uniform,
    })
}

// ============================================================================
// RESOURCES
// ============================================================================

struct GpuBuffer {
    desc: BufferDesc,
    buffer: wgpu::Buffer,
    counter: Option<wgpu::Buffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPart {
    Data,
    Counter,
}

/// Name-resolved bindings of one pipeline plus its cached bind group.
struct BindingTable {
    layout: ShaderLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    uniforms: wgpu::Buffer,
    bound: HashMap<u32, (BufferId, BufferPart)>,
    bind_group: Option<wgpu::BindGroup>,
}

impl BindingTable {
    fn bind(&mut self, name: &str, buffer: BufferId, has_counter: bool) -> CullResult<()> {
        let slot = self
            .layout
            .binding(name)
            .filter(|b| !b.uniform)
            .ok_or_else(|| CullError::InvalidHandle(format!("binding {name}")))?
            .index;
        self.bound.insert(slot, (buffer, BufferPart::Data));

        if has_counter {
            let counter_name = format!("{name}{COUNTER_BINDING_SUFFIX}");
            if let Some(counter) = self.layout.binding(&counter_name) {
                self.bound.insert(counter.index, (buffer, BufferPart::Counter));
            }
        }
        self.bind_group = None;
        Ok(())
    }

    fn unbind(&mut self, buffer: BufferId) {
        let before = self.bound.len();
        self.bound.retain(|_, (bound, _)| *bound != buffer);
        if self.bound.len() != before {
            self.bind_group = None;
        }
    }

    fn prepare(
        &mut self,
        device: &wgpu::Device,
        buffers: &HashMap<BufferId, GpuBuffer>,
        label: &str,
    ) -> CullResult<()> {
        if self.bind_group.is_some() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(self.layout.bindings.len());
        for binding in &self.layout.bindings {
            let resource = if binding.uniform {
                self.uniforms.as_entire_binding()
            } else {
                let (id, part) = self
                    .bound
                    .get(&binding.index)
                    .ok_or_else(|| CullError::Submission(format!("{} is not bound", binding.name)))?;
                let gpu = buffers.get(id).ok_or(CullError::InvalidBuffer(*id))?;
                match part {
                    BufferPart::Data => gpu.buffer.as_entire_binding(),
                    BufferPart::Counter => gpu
                        .counter
                        .as_ref()
                        .ok_or(CullError::InvalidBuffer(*id))?
                        .as_entire_binding(),
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: binding.index,
                resource,
            });
        }

        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.bind_group_layout,
            entries: &entries,
        }));
        Ok(())
    }
}

struct GpuProgram {
    module: wgpu::ShaderModule,
    layout: ShaderLayout,
}

struct GpuKernel {
    program: ProgramId,
    entry_point: String,
    pipeline: wgpu::ComputePipeline,
    table: BindingTable,
}

struct GpuMaterial {
    pipeline: wgpu::RenderPipeline,
    table: BindingTable,
}

struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
}

struct RenderTarget {
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

impl RenderTarget {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = |label, format, usage| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        };

        let color = texture(
            "instacull.color",
            COLOR_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let depth = texture(
            "instacull.depth",
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );

        Self {
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
            color,
        }
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Production [`GpuBackend`] over `wgpu`.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    compute_supported: bool,
    next_handle: u32,
    buffers: HashMap<BufferId, GpuBuffer>,
    programs: HashMap<ProgramId, GpuProgram>,
    kernels: HashMap<KernelId, GpuKernel>,
    materials: HashMap<MaterialId, GpuMaterial>,
    meshes: HashMap<MeshId, GpuMesh>,
    target: RenderTarget,
    clear_color: wgpu::Color,
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("compute_supported", &self.compute_supported)
            .field("buffers", &self.buffers.len())
            .field("kernels", &self.kernels.len())
            .field("materials", &self.materials.len())
            .field("meshes", &self.meshes.len())
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    /// Acquires an adapter and device without a window and renders into an
    /// offscreen target of the given size.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no adapter or device can be acquired.
    pub async fn headless(width: u32, height: u32) -> CullResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| CullError::DeviceUnavailable("no suitable adapter".into()))?;

        let info = adapter.get_info();
        tracing::info!("GPU adapter: {} ({:?})", info.name, info.backend);

        let compute_supported = adapter.get_downlevel_capabilities().flags.contains(
            wgpu::DownlevelFlags::COMPUTE_SHADERS | wgpu::DownlevelFlags::INDIRECT_EXECUTION,
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("instacull.device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| CullError::DeviceUnavailable(e.to_string()))?;

        Ok(Self::new(
            Arc::new(device),
            Arc::new(queue),
            compute_supported,
            width,
            height,
        ))
    }

    /// Wraps an existing device and queue.
    #[must_use]
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        compute_supported: bool,
        width: u32,
        height: u32,
    ) -> Self {
        let target = RenderTarget::new(&device, width, height);
        Self {
            device,
            queue,
            compute_supported,
            next_handle: 1,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            materials: HashMap::new(),
            meshes: HashMap::new(),
            target,
            clear_color: wgpu::Color {
                r: 0.02,
                g: 0.02,
                b: 0.05,
                a: 1.0,
            },
        }
    }

    fn next_raw(&mut self) -> u32 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    /// The device.
    #[must_use]
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// The offscreen color target.
    #[must_use]
    pub fn color_target(&self) -> &wgpu::Texture {
        &self.target.color
    }

    /// Recreates the offscreen targets.
    pub fn resize_target(&mut self, width: u32, height: u32) {
        self.target = RenderTarget::new(&self.device, width, height);
    }

    /// Compiles a WGSL compute program.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the module fails validation.
    pub fn load_program(&mut self, label: &str, source: &str) -> CullResult<ProgramId> {
        let module = self.compile(label, source)?;
        let id = ProgramId::new(self.next_raw());
        self.programs.insert(
            id,
            GpuProgram {
                module,
                layout: ShaderLayout::scan(source),
            },
        );
        Ok(id)
    }

    /// Compiles a WGSL render material.
    ///
    /// The module must export one `@vertex` and one `@fragment` entry point,
    /// read vertex positions from `@location(0)` and take its view-projection
    /// from its `var<uniform>` binding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the module is invalid or lacks an entry point.
    pub fn load_material(&mut self, label: &str, source: &str) -> CullResult<MaterialId> {
        let module = self.compile(label, source)?;
        let layout = ShaderLayout::scan(source);
        let (Some(vs), Some(fs)) = (
            layout.entry_point(ShaderStage::Vertex),
            layout.entry_point(ShaderStage::Fragment),
        ) else {
            return Err(CullError::InvalidConfig(format!(
                "{label}: material needs a vertex and a fragment entry point"
            )));
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: None,
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: vs,
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<MeshVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[wgpu::VertexAttribute {
                        offset: 0,
                        shader_location: 0,
                        format: wgpu::VertexFormat::Float32x3,
                    }],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: fs,
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(CullError::InvalidConfig(format!("{label}: {error}")));
        }

        let table = BindingTable {
            bind_group_layout: pipeline.get_bind_group_layout(0),
            uniforms: self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("instacull.camera_uniforms"),
                size: CAMERA_UNIFORM_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            layout,
            bound: HashMap::new(),
            bind_group: None,
        };

        let id = MaterialId::new(self.next_raw());
        self.materials.insert(id, GpuMaterial { pipeline, table });
        Ok(id)
    }

    /// Uploads mesh geometry and describes its whole range as submesh 0.
    pub fn upload_mesh(&mut self, geometry: &MeshGeometry) -> MeshDesc {
        let vertices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("instacull.mesh_vertices"),
            contents: bytemuck::cast_slice(&geometry.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("instacull.mesh_indices"),
            contents: bytemuck::cast_slice(&geometry.indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let mesh = MeshId::new(self.next_raw());
        self.meshes.insert(mesh, GpuMesh { vertices, indices });
        MeshDesc {
            mesh,
            bounds_extents: geometry.bounds_extents,
            submesh: geometry.full_range(),
        }
    }

    /// Reads a buffer's contents back to the host.
    ///
    /// Diagnostics only: this stalls until the device is idle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBuffer` for unknown handles or `Submission` if mapping fails.
    pub fn read_buffer_blocking(&self, buffer: BufferId) -> CullResult<Vec<u8>> {
        let gpu = self.buffers.get(&buffer).ok_or(CullError::InvalidBuffer(buffer))?;
        self.read_back(&gpu.buffer, gpu.desc.size_bytes())
    }

    /// Reads the live counter of an append buffer. Diagnostics only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBuffer` for unknown handles or buffers without counter.
    pub fn read_counter_blocking(&self, buffer: BufferId) -> CullResult<u32> {
        let counter = self
            .buffers
            .get(&buffer)
            .and_then(|gpu| gpu.counter.as_ref())
            .ok_or(CullError::InvalidBuffer(buffer))?;
        let bytes = self.read_back(counter, COUNTER_SIZE)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads an indirect argument buffer. Diagnostics only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBuffer` for unknown or undersized handles.
    pub fn read_draw_arguments_blocking(&self, buffer: BufferId) -> CullResult<DrawArguments> {
        let bytes = self.read_buffer_blocking(buffer)?;
        let image: &[u8; DrawArguments::SIZE] = bytes
            .get(..DrawArguments::SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(CullError::InvalidBuffer(buffer))?;
        Ok(DrawArguments::from_le_bytes(image))
    }

    fn read_back(&self, source: &wgpu::Buffer, size: u64) -> CullResult<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("instacull.readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("instacull.readback"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| CullError::Submission(e.to_string()))?
            .map_err(|e| CullError::Submission(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn compile(&self, label: &str, source: &str) -> CullResult<wgpu::ShaderModule> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(CullError::InvalidConfig(format!("{label}: {error}"))),
            None => Ok(module),
        }
    }

    fn gpu_buffer(&self, id: BufferId) -> CullResult<&GpuBuffer> {
        self.buffers.get(&id).ok_or(CullError::InvalidBuffer(id))
    }

    fn counter_of(&self, id: BufferId) -> CullResult<&wgpu::Buffer> {
        let gpu = self.gpu_buffer(id)?;
        gpu.counter
            .as_ref()
            .ok_or_else(|| CullError::Submission(format!("{} has no counter", gpu.desc.label)))
    }

    /// Uploads per-command uniforms and builds missing bind groups.
    ///
    /// Uniform writes land before the submission, so a stream may dispatch a
    /// given kernel (or draw with a given material) at most once.
    fn prepare(&mut self, stream: &CommandStream) -> CullResult<()> {
        for command in stream.commands() {
            match command {
                FrameCommand::ResetCounter { buffer } => {
                    self.counter_of(*buffer)?;
                }
                FrameCommand::CopyCounter { source, target, .. } => {
                    self.counter_of(*source)?;
                    self.gpu_buffer(*target)?;
                }
                FrameCommand::Dispatch {
                    kernel, uniforms, ..
                } => {
                    let gpu = self
                        .kernels
                        .get_mut(kernel)
                        .ok_or_else(|| CullError::InvalidHandle(format!("kernel {}", kernel.raw())))?;
                    gpu.table.prepare(&self.device, &self.buffers, "instacull.kernel_bindings")?;
                    self.queue
                        .write_buffer(&gpu.table.uniforms, 0, bytemuck::bytes_of::<CullingUniforms>(uniforms));
                }
                FrameCommand::DrawIndexedIndirect {
                    mesh,
                    material,
                    arguments,
                    view_projection,
                } => {
                    if !self.meshes.contains_key(mesh) {
                        return Err(CullError::InvalidHandle(format!("mesh {}", mesh.raw())));
                    }
                    self.gpu_buffer(*arguments)?;
                    let gpu = self.materials.get_mut(material).ok_or_else(|| {
                        CullError::InvalidHandle(format!("material {}", material.raw()))
                    })?;
                    gpu.table.prepare(&self.device, &self.buffers, "instacull.material_bindings")?;
                    self.queue
                        .write_buffer(&gpu.table.uniforms, 0, bytemuck::cast_slice(view_projection));
                }
            }
        }
        Ok(())
    }

    fn encode(&self, stream: &CommandStream) -> CullResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("instacull.frame"),
            });
        let mut cleared = false;

        for command in stream.commands() {
            match *command {
                FrameCommand::ResetCounter { buffer } => {
                    encoder.clear_buffer(self.counter_of(buffer)?, 0, None);
                }
                FrameCommand::Dispatch { kernel, groups, .. } => {
                    let gpu = self
                        .kernels
                        .get(&kernel)
                        .ok_or_else(|| CullError::InvalidHandle(format!("kernel {}", kernel.raw())))?;
                    let bind_group = gpu
                        .table
                        .bind_group
                        .as_ref()
                        .ok_or_else(|| CullError::Submission(format!("{} has no bindings", gpu.entry_point)))?;

                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("instacull.cull"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&gpu.pipeline);
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                }
                FrameCommand::CopyCounter {
                    source,
                    target,
                    offset_bytes,
                } => {
                    let counter = self.counter_of(source)?;
                    let target = &self.gpu_buffer(target)?.buffer;
                    encoder.copy_buffer_to_buffer(counter, 0, target, offset_bytes, COUNTER_SIZE);
                }
                FrameCommand::DrawIndexedIndirect {
                    mesh,
                    material,
                    arguments,
                    ..
                } => {
                    let mesh = self
                        .meshes
                        .get(&mesh)
                        .ok_or_else(|| CullError::InvalidHandle(format!("mesh {}", mesh.raw())))?;
                    let gpu = self.materials.get(&material).ok_or_else(|| {
                        CullError::InvalidHandle(format!("material {}", material.raw()))
                    })?;
                    let bind_group = gpu.table.bind_group.as_ref().ok_or_else(|| {
                        CullError::Submission(format!("material {} has no bindings", material.raw()))
                    })?;
                    let arguments = &self.gpu_buffer(arguments)?.buffer;

                    let load = if cleared {
                        wgpu::LoadOp::Load
                    } else {
                        wgpu::LoadOp::Clear(self.clear_color)
                    };
                    let depth_load = if cleared {
                        wgpu::LoadOp::Load
                    } else {
                        wgpu::LoadOp::Clear(1.0)
                    };
                    cleared = true;

                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("instacull.draw"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &self.target.color_view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &self.target.depth_view,
                            depth_ops: Some(wgpu::Operations {
                                load: depth_load,
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        ..Default::default()
                    });
                    pass.set_pipeline(&gpu.pipeline);
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.set_vertex_buffer(0, mesh.vertices.slice(..));
                    pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed_indirect(arguments, 0);
                }
            }
        }

        Ok(encoder.finish())
    }
}

impl GpuBackend for WgpuBackend {
    fn supports_compute(&self) -> bool {
        self.compute_supported
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> CullResult<BufferId> {
        let size = desc.size_bytes();
        let failed = CullError::AllocationFailed {
            label: desc.label,
            size,
        };

        let limits = self.device.limits();
        let storage = desc.kind != BufferKind::IndirectArguments;
        if size == 0
            || size > limits.max_buffer_size
            || (storage && size > u64::from(limits.max_storage_buffer_binding_size))
        {
            return Err(failed);
        }
        if let Some(bytes) = contents {
            if bytes.len() as u64 != size {
                return Err(CullError::InvalidConfig(format!(
                    "{}: {} bytes of contents for a {size} byte buffer",
                    desc.label,
                    bytes.len()
                )));
            }
        }

        let usage = match desc.kind {
            BufferKind::Structured | BufferKind::Append => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
            }
            BufferKind::IndirectArguments => {
                wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = match contents {
            Some(bytes) => self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(desc.label),
                contents: bytes,
                usage,
            }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage,
                mapped_at_creation: false,
            }),
        };
        let counter = (desc.kind == BufferKind::Append).then(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("instacull.append_counter"),
                size: COUNTER_SIZE,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(failed);
        }

        let id = BufferId::new(self.next_raw());
        self.buffers.insert(
            id,
            GpuBuffer {
                desc: *desc,
                buffer,
                counter,
            },
        );
        tracing::trace!("Allocated {} ({} bytes)", desc.label, size);
        Ok(id)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        let Some(gpu) = self.buffers.remove(&buffer) else {
            tracing::warn!("Release of unknown buffer {}", buffer.raw());
            return;
        };
        for kernel in self.kernels.values_mut() {
            kernel.table.unbind(buffer);
        }
        for material in self.materials.values_mut() {
            material.table.unbind(buffer);
        }
        gpu.buffer.destroy();
        if let Some(counter) = gpu.counter {
            counter.destroy();
        }
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.buffers.get(&buffer).map(|gpu| gpu.desc.size_bytes())
    }

    fn find_kernel(&mut self, program: ProgramId, entry_point: &str) -> CullResult<KernelId> {
        let gpu_program = self
            .programs
            .get(&program)
            .ok_or_else(|| CullError::InvalidHandle(format!("program {}", program.raw())))?;
        if !gpu_program.layout.has_entry_point(ShaderStage::Compute, entry_point) {
            return Err(CullError::EntryPointNotFound(entry_point.to_owned()));
        }
        if let Some((&id, _)) = self
            .kernels
            .iter()
            .find(|(_, k)| k.program == program && k.entry_point == entry_point)
        {
            return Ok(id);
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: None,
            module: &gpu_program.module,
            entry_point,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(CullError::EntryPointNotFound(format!("{entry_point}: {error}")));
        }

        let table = BindingTable {
            bind_group_layout: pipeline.get_bind_group_layout(0),
            uniforms: self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("instacull.culling_uniforms"),
                size: std::mem::size_of::<CullingUniforms>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            layout: gpu_program.layout.clone(),
            bound: HashMap::new(),
            bind_group: None,
        };

        let id = KernelId::new(self.next_raw());
        self.kernels.insert(
            id,
            GpuKernel {
                program,
                entry_point: entry_point.to_owned(),
                pipeline,
                table,
            },
        );
        Ok(id)
    }

    fn bind_kernel_buffer(&mut self, kernel: KernelId, name: &str, buffer: BufferId) -> CullResult<()> {
        let has_counter = self.gpu_buffer(buffer)?.counter.is_some();
        self.kernels
            .get_mut(&kernel)
            .ok_or_else(|| CullError::InvalidHandle(format!("kernel {}", kernel.raw())))?
            .table
            .bind(name, buffer, has_counter)
    }

    fn bind_material_buffer(
        &mut self,
        material: MaterialId,
        name: &str,
        buffer: BufferId,
    ) -> CullResult<()> {
        let has_counter = self.gpu_buffer(buffer)?.counter.is_some();
        self.materials
            .get_mut(&material)
            .ok_or_else(|| CullError::InvalidHandle(format!("material {}", material.raw())))?
            .table
            .bind(name, buffer, has_counter)
    }

    fn submit(&mut self, stream: &CommandStream) -> CullResult<()> {
        self.prepare(stream)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let submitted = self.encode(stream).map(|commands| {
            self.queue.submit(std::iter::once(commands));
        });
        let validation = pollster::block_on(self.device.pop_error_scope());

        // Pop the scope before reporting encode errors so scopes stay balanced.
        submitted?;
        match validation {
            Some(error) => Err(CullError::Submission(error.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ALL_INSTANCES_BINDING, VISIBLE_INSTANCES_BINDING};
    use crate::culling::{CULL_KERNEL_NAME, CULL_SHADER_SOURCE};
    use crate::pipeline::RENDER_SHADER_SOURCE;

    #[test]
    fn test_scan_culling_kernel() {
        let layout = ShaderLayout::scan(CULL_SHADER_SOURCE);

        assert!(layout.has_entry_point(ShaderStage::Compute, CULL_KERNEL_NAME));
        assert!(!layout.has_entry_point(ShaderStage::Compute, "inside_frustum"));

        let all = layout.binding(ALL_INSTANCES_BINDING).unwrap();
        let visible = layout.binding(VISIBLE_INSTANCES_BINDING).unwrap();
        let counter = layout
            .binding(&format!("{VISIBLE_INSTANCES_BINDING}{COUNTER_BINDING_SUFFIX}"))
            .unwrap();
        let params = layout.binding("params").unwrap();

        assert_eq!((all.index, all.uniform), (1, false));
        assert_eq!(visible.index, 2);
        assert_eq!(counter.index, 3);
        assert!(params.uniform);
    }

    #[test]
    fn test_scan_material() {
        let layout = ShaderLayout::scan(RENDER_SHADER_SOURCE);

        assert_eq!(layout.entry_point(ShaderStage::Vertex), Some("vs_main"));
        assert_eq!(layout.entry_point(ShaderStage::Fragment), Some("fs_main"));
        assert_eq!(layout.entry_point(ShaderStage::Compute), None);
        assert_eq!(layout.binding(VISIBLE_INSTANCES_BINDING).map(|b| b.index), Some(1));
        assert!(layout.binding("camera").is_some_and(|b| b.uniform));
    }

    fn validated(source: &str) -> naga::Module {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(source)));
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::empty())
            .validate(&module)
            .unwrap();
        module
    }

    #[test]
    fn test_culling_kernel_validates() {
        let module = validated(CULL_SHADER_SOURCE);

        let entry = module
            .entry_points
            .iter()
            .find(|e| e.name == CULL_KERNEL_NAME)
            .unwrap();
        assert_eq!(entry.stage, naga::ShaderStage::Compute);
        assert_eq!(entry.workgroup_size, [crate::culling::THREAD_GROUP_SIZE, 1, 1]);

        let (_, uniforms) = module
            .types
            .iter()
            .find(|(_, ty)| ty.name.as_deref() == Some("CullingUniforms"))
            .unwrap();
        let naga::TypeInner::Struct { members, span } = &uniforms.inner else {
            panic!("CullingUniforms is not a struct");
        };
        assert_eq!(*span as usize, std::mem::size_of::<CullingUniforms>());
        assert_eq!(*span, 176);
        let names: Vec<_> = members.iter().filter_map(|m| m.name.as_deref()).collect();
        assert_eq!(
            &names[..4],
            ["_FrustumPlanes", "_CameraLocalToWorld", "_MaxDistance", "_InstanceRadius"]
        );
        let offsets: Vec<_> = members.iter().map(|m| m.offset).collect();
        assert_eq!(&offsets[..4], [0, 96, 160, 164]);
    }

    #[test]
    fn test_material_validates() {
        let module = validated(RENDER_SHADER_SOURCE);
        let stages: Vec<_> = module.entry_points.iter().map(|e| e.stage).collect();
        assert!(stages.contains(&naga::ShaderStage::Vertex));
        assert!(stages.contains(&naga::ShaderStage::Fragment));
    }

    #[test]
    fn test_parse_binding_forms() {
        let uniform = parse_binding("@group(0) @binding(7) var<uniform> data: Params;").unwrap();
        assert_eq!(uniform.name, "data");
        assert_eq!(uniform.index, 7);
        assert!(uniform.uniform);

        let texture = parse_binding("@group(0) @binding(2) var color_tex: texture_2d<f32>;").unwrap();
        assert_eq!(texture.name, "color_tex");
        assert!(!texture.uniform);

        assert!(parse_binding("let x = 1;").is_none());
    }
}
