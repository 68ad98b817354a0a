//! Configuration loading for a headless Protocell run.
//!
//! The canonical configuration lives in `protocell-config.yaml` at the
//! project root. Every section and field has a named default, so an empty
//! file describes a valid run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use protocell_types::{GeneralSettings, InvalidParameter, Settings, SimulationParameters};
use protocell_world::{CompartmentGraph, PopulationRecipe, WorldError};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A simulation parameter is out of its domain.
    #[error("invalid config: {source}")]
    Invalid {
        /// The rejected parameter.
        #[from]
        source: InvalidParameter,
    },

    /// The world cannot be partitioned as configured.
    #[error("invalid world layout: {source}")]
    World {
        /// The layout error.
        #[from]
        source: WorldError,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `protocell-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// World layout, threads and seed.
    #[serde(default)]
    pub general: GeneralSettings,

    /// Per-step simulation parameters.
    #[serde(default)]
    pub parameters: SimulationParameters,

    /// Initial population seeded into an empty world.
    #[serde(default)]
    pub population: PopulationRecipe,

    /// Run bounds.
    #[serde(default)]
    pub run: RunConfig,
}

/// Bounds and pacing of a continuous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Stop after this many steps (0 = unlimited).
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Upper bound on steps per second (0 = unrestricted).
    #[serde(default)]
    pub tps_restriction: u32,

    /// Log a statistics line every this many steps (0 = never).
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tps_restriction: 0,
            report_interval: default_report_interval(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, and
    /// [`ConfigError::Invalid`] or [`ConfigError::World`] if a value is out
    /// of its domain.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parameters.validate()?;
        CompartmentGraph::build(self.general.world_size, self.general.grid_dims)?;
        if self.general.thread_count == 0 {
            return Err(ConfigError::Invalid {
                source: InvalidParameter {
                    name: "thread_count",
                    reason: "must be at least 1".to_owned(),
                },
            });
        }
        Ok(())
    }

    /// General settings and parameters as one value.
    pub fn settings(&self) -> Settings {
        Settings {
            general: self.general.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

const fn default_max_steps() -> u64 {
    1000
}

const fn default_report_interval() -> u64 {
    100
}
