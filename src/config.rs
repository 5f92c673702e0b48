//! Runtime configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageKind;

/// Smallest transfer chunk any supported board's USB buffer carries.
pub const MIN_CHUNK_SIZE: usize = 220;
/// Largest transfer chunk.
pub const MAX_CHUNK_SIZE: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk_size must be in {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}, got {0}")]
    InvalidChunkSize(usize),
    #[error("debug_level must be in 0..=3, got {0}")]
    InvalidDebugLevel(u8),
    #[error("external RAM enabled but its budget is 0")]
    MissingExternalBudget,
    #[error("internal RAM budget is 0")]
    MissingInternalBudget,
}

/// Board- and host-level knobs, layered from defaults, profile files and
/// `QFOREST_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// Route `Any` allocations to external pseudo-static RAM first.
    pub use_external_ram: bool,
    /// Internal RAM budget for pool accounting, in bytes.
    pub internal_ram_budget: usize,
    /// External RAM budget, in bytes. Ignored without `use_external_ram`.
    pub external_ram_budget: usize,
    /// Diagnostic verbosity, 0..=3.
    pub debug_level: u8,
    /// Serial transfer chunk payload size, in bytes.
    pub chunk_size: usize,
    /// Storage backend to mount.
    pub storage: StorageKind,
    /// Whether an SD card is present.
    pub sd_available: bool,
    /// Base directory for host-backed storage.
    pub host_base: Option<PathBuf>,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        RuntimeConfiguration {
            use_external_ram: cfg!(feature = "external-ram"),
            internal_ram_budget: 320 * 1024,
            external_ram_budget: 4 * 1024 * 1024,
            debug_level: 1,
            chunk_size: MIN_CHUNK_SIZE,
            storage: StorageKind::FlashLog,
            sd_available: false,
            host_base: None,
        }
    }
}

impl RuntimeConfiguration {
    /// Checks value ranges; called once at init.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        if self.debug_level > 3 {
            return Err(ConfigError::InvalidDebugLevel(self.debug_level));
        }
        if self.internal_ram_budget == 0 {
            return Err(ConfigError::MissingInternalBudget);
        }
        if self.use_external_ram && self.external_ram_budget == 0 {
            return Err(ConfigError::MissingExternalBudget);
        }
        Ok(())
    }

    /// Layers `QFOREST_*` environment variables over the defaults.
    #[cfg(feature = "figment_config")]
    pub fn from_env() -> Result<Self, Box<figment::Error>> {
        use figment::{
            providers::{Env, Serialized},
            Figment,
        };
        let config: RuntimeConfiguration = Figment::new()
            .merge(Serialized::defaults(RuntimeConfiguration::default()))
            .merge(Env::prefixed("QFOREST_"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    #[cfg(feature = "figment_config")]
    /// Layers a JSON profile string, then the environment.
    pub fn from_profile(json: &str) -> Result<Self, Box<figment::Error>> {
        use figment::{
            providers::{Env, Format, Json, Serialized},
            Figment,
        };
        let config: RuntimeConfiguration = Figment::new()
            .merge(Serialized::defaults(RuntimeConfiguration::default()))
            .merge(Json::string(json))
            .merge(Env::prefixed("QFOREST_"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }
}
