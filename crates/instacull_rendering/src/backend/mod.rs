//! Device abstraction for the culling pipeline.
//!
//! The culler never talks to a graphics API directly. It allocates buffers,
//! resolves kernels and binds resources through [`GpuBackend`], and records
//! each frame as a [`CommandStream`] that the backend executes in program
//! order as a single submission.
//!
//! ## Backends
//!
//! - [`WgpuBackend`]: production device over `wgpu` + WGSL
//! - [`SoftwareBackend`]: CPU device with the same command semantics

mod software;
mod wgpu_backend;

pub use software::{DrawRecord, SoftwareBackend};
pub use wgpu_backend::WgpuBackend;

use crate::culling::CullingUniforms;
use crate::error::CullResult;

/// Binding name of the read-only instance array on the culling kernel.
pub const ALL_INSTANCES_BINDING: &str = "_AllInstancesData";

/// Binding name of the append target (kernel) and instance source (material).
pub const VISIBLE_INSTANCES_BINDING: &str = "_VisibleInstancesData";

/// Suffix of the binding that receives an append buffer's counter.
///
/// Binding an append buffer to `X` also binds its counter to `XCount` when
/// the shader declares it.
pub const COUNTER_BINDING_SUFFIX: &str = "Count";

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Wraps a raw backend index.
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Returns the raw backend index.
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Handle to a device buffer owned by a backend.
    BufferId
);
handle_type!(
    /// Handle to an uploaded render mesh.
    MeshId
);
handle_type!(
    /// Handle to a render material (render pipeline + its bindings).
    MaterialId
);
handle_type!(
    /// Handle to a compiled compute program.
    ProgramId
);
handle_type!(
    /// Handle to a resolved compute entry point.
    KernelId
);

/// How a buffer is used on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Read-only structured array.
    Structured,
    /// Append-structured array with a live counter.
    Append,
    /// Indirect draw arguments.
    IndirectArguments,
}

/// Descriptor for creating a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug label.
    pub label: &'static str,
    /// Usage.
    pub kind: BufferKind,
    /// Number of elements.
    pub element_count: u32,
    /// Size of one element in bytes.
    pub stride: u32,
}

impl BufferDesc {
    /// Total size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.element_count as u64 * self.stride as u64
    }
}

/// One device command of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameCommand {
    /// Set the live counter of an append buffer to zero.
    ResetCounter {
        /// Append buffer.
        buffer: BufferId,
    },
    /// Run a compute kernel over `groups` workgroups.
    Dispatch {
        /// Resolved kernel.
        kernel: KernelId,
        /// Per-dispatch uniforms.
        uniforms: CullingUniforms,
        /// Workgroup count (x, y, z).
        groups: [u32; 3],
    },
    /// Copy the live counter of `source` into 4 bytes of `target`.
    CopyCounter {
        /// Append buffer whose counter is read.
        source: BufferId,
        /// Destination buffer.
        target: BufferId,
        /// Byte offset inside `target`.
        offset_bytes: u64,
    },
    /// Indexed, instanced draw reading its parameters from `arguments`.
    DrawIndexedIndirect {
        /// Render mesh.
        mesh: MeshId,
        /// Render material.
        material: MaterialId,
        /// Indirect argument buffer.
        arguments: BufferId,
        /// Camera view-projection for the material.
        view_projection: [[f32; 4]; 4],
    },
}

/// Ordered list of commands submitted to the device as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandStream {
    commands: Vec<FrameCommand>,
}

impl CommandStream {
    /// Creates an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: Vec::with_capacity(4),
        }
    }

    /// Appends a command.
    pub fn push(&mut self, command: FrameCommand) {
        self.commands.push(command);
    }

    /// Returns the recorded commands in submission order.
    #[must_use]
    pub fn commands(&self) -> &[FrameCommand] {
        &self.commands
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// A compute + graphics device able to run the culling pipeline.
///
/// Implementations own every resource behind the handles they return.
/// Handles stay valid until released; using a released handle is a
/// contract violation reported as an error, never a panic.
pub trait GpuBackend {
    /// Returns true if the device can run compute shaders.
    fn supports_compute(&self) -> bool;

    /// Allocates a buffer, optionally initialised with `contents`.
    ///
    /// `contents`, when present, must be exactly `desc.size_bytes()` long.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` when the device refuses the allocation.
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> CullResult<BufferId>;

    /// Frees a buffer and drops every binding that references it.
    ///
    /// Unknown or already released handles are ignored.
    fn release_buffer(&mut self, buffer: BufferId);

    /// Size in bytes of a live buffer.
    fn buffer_size(&self, buffer: BufferId) -> Option<u64>;

    /// Resolves a compute entry point of a program.
    ///
    /// # Errors
    ///
    /// Returns `EntryPointNotFound` if the program does not export it.
    fn find_kernel(&mut self, program: ProgramId, entry_point: &str) -> CullResult<KernelId>;

    /// Binds a buffer to a named slot of a kernel.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown handles or binding names.
    fn bind_kernel_buffer(&mut self, kernel: KernelId, name: &str, buffer: BufferId) -> CullResult<()>;

    /// Binds a buffer to a named slot of a render material.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown handles or binding names.
    fn bind_material_buffer(
        &mut self,
        material: MaterialId,
        name: &str,
        buffer: BufferId,
    ) -> CullResult<()>;

    /// Executes the stream in order as one submission.
    ///
    /// # Errors
    ///
    /// Returns `Submission` if the device rejects the commands.
    fn submit(&mut self, stream: &CommandStream) -> CullResult<()>;
}
