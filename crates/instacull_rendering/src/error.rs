//! # Culling Error Types
//!
//! All errors that can occur while configuring or driving the culler.

use std::fmt;

use thiserror::Error;

use crate::backend::BufferId;

/// A requirement that must be present before the culler can initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// No render mesh configured.
    RenderMesh,
    /// No render material configured.
    RenderMaterial,
    /// No culling compute program configured.
    CullingProgram,
    /// The camera provider has no active camera.
    ActiveCamera,
    /// The device cannot run compute shaders.
    ComputeSupport,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RenderMesh => "render mesh",
            Self::RenderMaterial => "render material",
            Self::CullingProgram => "culling program",
            Self::ActiveCamera => "active camera",
            Self::ComputeSupport => "compute shader support",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the culling pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CullError {
    /// A mesh, material, program, camera or compute support is missing.
    #[error("missing requirement: {0}")]
    MissingRequirement(Requirement),

    /// Settings or population do not satisfy their preconditions.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The device refused a buffer allocation.
    #[error("allocation failed for {label}: {size} bytes")]
    AllocationFailed {
        /// Debug label of the buffer.
        label: &'static str,
        /// Requested size in bytes.
        size: u64,
    },

    /// The culling program has no usable entry point with this name.
    #[error("entry point not found: {0}")]
    EntryPointNotFound(String),

    /// A buffer handle that is unknown or already released was used.
    #[error("invalid buffer handle: {0:?}")]
    InvalidBuffer(BufferId),

    /// A mesh, material, program or kernel handle is unknown to the backend.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Command submission for a frame failed.
    #[error("submission failed: {0}")]
    Submission(String),

    /// Settings file could not be read or parsed.
    #[error("settings error: {0}")]
    Settings(String),

    /// No adapter or device could be acquired.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl CullError {
    /// Returns true for errors that leave the culler uninitialized but are
    /// retried automatically on the next frame.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingRequirement(_)
                | Self::InvalidConfig(_)
                | Self::AllocationFailed { .. }
                | Self::EntryPointNotFound(_)
                | Self::Submission(_)
        )
    }
}

/// Result type for culling operations.
pub type CullResult<T> = Result<T, CullError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = CullError::MissingRequirement(Requirement::ActiveCamera);
        assert_eq!(err.to_string(), "missing requirement: active camera");

        let err = CullError::AllocationFailed { label: "pool", size: 64 };
        assert_eq!(err.to_string(), "allocation failed for pool: 64 bytes");
    }

    #[test]
    fn test_contract_violations_are_not_recoverable() {
        assert!(CullError::Submission("lost".into()).is_recoverable());
        assert!(!CullError::InvalidBuffer(BufferId::new(3)).is_recoverable());
        assert!(!CullError::InvalidHandle("kernel 9".into()).is_recoverable());
    }
}
