//! Culler configuration.
//!
//! [`CullerSettings`] is the numeric part, loadable from TOML. [`CullerConfig`]
//! adds the device resources (mesh, material, program) and the population
//! source. Any change to a `CullerConfig` means release + initialize.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{MaterialId, ProgramId};
use crate::error::{CullError, CullResult};
use crate::instancing::PopulationSource;
use crate::mesh::MeshDesc;

/// Smallest allowed instance count.
pub const MIN_INSTANCE_COUNT: u32 = 1;

/// Largest allowed instance count.
pub const MAX_INSTANCE_COUNT: u32 = 400_000;

/// Numeric settings, as stored in a settings file.
///
/// ```toml
/// instance_count = 10000
/// area_size = 100.0
/// radius_multiplier = 1.0
/// seed = 7
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CullerSettings {
    /// Number of instances, in `[1, 400000]`.
    pub instance_count: u32,
    /// Diameter of the disc instances are scattered on.
    pub area_size: f32,
    /// Scale applied to the mesh bounding radius.
    pub radius_multiplier: f32,
    /// Population seed.
    pub seed: u64,
}

impl Default for CullerSettings {
    fn default() -> Self {
        Self {
            instance_count: 10_000,
            area_size: 100.0,
            radius_multiplier: 1.0,
            seed: 0,
        }
    }
}

impl CullerSettings {
    /// Parses and validates settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Settings` on parse errors and `InvalidConfig` on out-of-range values.
    pub fn from_toml_str(text: &str) -> CullResult<Self> {
        let settings: Self = toml::from_str(text).map_err(|e| CullError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and validates a settings file.
    ///
    /// # Errors
    ///
    /// Returns `Settings` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> CullResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CullError::Settings(format!("{}: {e}", path.display())))?;
        let settings = Self::from_toml_str(&text)?;
        tracing::info!("Loaded culler settings from {}", path.display());
        Ok(settings)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> CullResult<()> {
        if !(MIN_INSTANCE_COUNT..=MAX_INSTANCE_COUNT).contains(&self.instance_count) {
            return Err(CullError::InvalidConfig(format!(
                "instance_count {} outside [{MIN_INSTANCE_COUNT}, {MAX_INSTANCE_COUNT}]",
                self.instance_count
            )));
        }
        check_non_negative("area_size", self.area_size)?;
        check_non_negative("radius_multiplier", self.radius_multiplier)
    }
}

fn check_non_negative(name: &str, value: f32) -> CullResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CullError::InvalidConfig(format!(
            "{name} must be finite and >= 0, got {value}"
        )))
    }
}

/// Complete culler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CullerConfig {
    /// Mesh drawn for every visible instance.
    pub render_mesh: Option<MeshDesc>,
    /// Material reading `_VisibleInstancesData`.
    pub render_material: Option<MaterialId>,
    /// Program exporting `CullInstances`.
    pub culling_program: Option<ProgramId>,
    /// Number of instances, in `[1, 400000]`.
    pub instance_count: u32,
    /// Diameter of the random placement disc.
    pub area_size: f32,
    /// Scale applied to the mesh bounding radius.
    pub radius_multiplier: f32,
    /// Where instances come from.
    pub population: PopulationSource,
}

impl Default for CullerConfig {
    fn default() -> Self {
        Self::from_settings(&CullerSettings::default())
    }
}

impl CullerConfig {
    /// Configuration with the given settings and no device resources yet.
    #[must_use]
    pub fn from_settings(settings: &CullerSettings) -> Self {
        Self {
            render_mesh: None,
            render_material: None,
            culling_program: None,
            instance_count: settings.instance_count,
            area_size: settings.area_size,
            radius_multiplier: settings.radius_multiplier,
            population: PopulationSource::Random {
                seed: settings.seed,
            },
        }
    }

    /// Sets the render mesh.
    #[must_use]
    pub fn with_mesh(mut self, mesh: MeshDesc) -> Self {
        self.render_mesh = Some(mesh);
        self
    }

    /// Sets the render material.
    #[must_use]
    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.render_material = Some(material);
        self
    }

    /// Sets the culling program.
    #[must_use]
    pub fn with_program(mut self, program: ProgramId) -> Self {
        self.culling_program = Some(program);
        self
    }

    /// Uses an explicit population and matches the instance count to it.
    #[must_use]
    pub fn with_population(mut self, population: PopulationSource) -> Self {
        if let PopulationSource::Explicit(records) = &population {
            self.instance_count = u32::try_from(records.len()).unwrap_or(u32::MAX);
        }
        self.population = population;
        self
    }

    /// Sets the instance count.
    #[must_use]
    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    /// Numeric settings view of this configuration.
    #[must_use]
    pub fn settings(&self) -> CullerSettings {
        CullerSettings {
            instance_count: self.instance_count,
            area_size: self.area_size,
            radius_multiplier: self.radius_multiplier,
            seed: match self.population {
                PopulationSource::Random { seed } => seed,
                PopulationSource::Explicit(_) => 0,
            },
        }
    }
}
