use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::sector::SECTOR_PAYLOAD_BYTES;
use crate::sensor::DataKind;
use crate::source::UploadSource;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage engine configuration.
    pub engine: EngineConfig,
    /// Sensors the daemon harness configures at startup.
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    /// HTTP diagnostics API configuration (optional).
    #[serde(default)]
    pub api: ApiConfig,
}

/// HTTP diagnostics API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Whether to enable the HTTP API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

/// Where the engine gets UTC milliseconds from.
///
/// `System` reads the OS clock and is always available (gateway profile).
/// `External` starts unknown; writes are gated until the caller supplies a
/// reference time after an external sync, after which the clock advances
/// on its own (embedded profile). `Manual` gates the same way but only
/// moves when the caller sets it — for hosts whose time is driven
/// entirely by an external scheduler, and for deterministic tests.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    #[default]
    System,
    External,
    Manual,
}

/// Storage engine parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Total bytes of the RAM sector pool. Sector count = pool_bytes / 32.
    #[serde(default = "default_pool_bytes")]
    pub pool_bytes: usize,
    /// Clock profile.
    #[serde(default)]
    pub time_source: TimeSource,
    /// Disk spool configuration. Absent selects the RAM-only profile:
    /// pool exhaustion discards the writing sensor's oldest non-pending
    /// sector instead of spooling.
    #[serde(default)]
    pub spool: Option<SpoolConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_bytes: default_pool_bytes(),
            time_source: TimeSource::default(),
            spool: None,
        }
    }
}

/// Disk spool parameters (gateway profile).
#[derive(Debug, Deserialize, Clone)]
pub struct SpoolConfig {
    /// Base directory; each upload source spools under its own subdirectory.
    pub base_path: PathBuf,
    /// Cap on the total bytes of spool files per upload source.
    #[serde(default = "default_per_source_byte_limit")]
    pub per_source_byte_limit: u64,
    /// Size at which the active spool file is closed and a new sequence opened.
    #[serde(default = "default_file_rotation_bytes")]
    pub file_rotation_bytes: u64,
    /// Pool occupancy percentage above which the spooler starts selecting.
    #[serde(default = "default_pressure_pct")]
    pub pressure_pct: u8,
    /// Maximum spool files tracked per upload source.
    #[serde(default = "default_max_tracked_files")]
    pub max_tracked_files_per_source: usize,
    /// Wall-clock budget for the power-down emergency flush.
    #[serde(default = "default_emergency_deadline_ms")]
    pub emergency_deadline_ms: u64,
    /// Let the cleanup phase unlink fully-acked files of sources with no
    /// active sensors. Off by default.
    #[serde(default)]
    pub cleanup_orphaned_files: bool,
}

/// One sensor the daemon registers at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct SensorEntry {
    pub source: UploadSource,
    pub id: u32,
    pub kind: DataKind,
}

fn default_pool_bytes() -> usize { 64 * 1024 }
fn default_per_source_byte_limit() -> u64 { 256 * 1024 * 1024 }
fn default_file_rotation_bytes() -> u64 { 64 * 1024 }
fn default_pressure_pct() -> u8 { 80 }
fn default_max_tracked_files() -> usize { 10 }
fn default_emergency_deadline_ms() -> u64 { 60_000 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StoreError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        let mut seen = std::collections::HashSet::new();
        for s in &self.sensors {
            if !seen.insert((s.source, s.id)) {
                return Err(StoreError::Config(format!(
                    "Duplicate sensor {}/{}", s.source, s.id
                )));
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_bytes < SECTOR_PAYLOAD_BYTES {
            return Err(StoreError::Config(format!(
                "pool_bytes must hold at least one {SECTOR_PAYLOAD_BYTES}-byte sector"
            )));
        }
        if let Some(spool) = &self.spool {
            if spool.pressure_pct == 0 || spool.pressure_pct > 100 {
                return Err(StoreError::Config("pressure_pct must be in 1..=100".into()));
            }
            if spool.file_rotation_bytes == 0 {
                return Err(StoreError::Config("file_rotation_bytes must be > 0".into()));
            }
            if spool.max_tracked_files_per_source == 0 {
                return Err(StoreError::Config("max_tracked_files_per_source must be > 0".into()));
            }
            if spool.per_source_byte_limit < spool.file_rotation_bytes {
                return Err(StoreError::Config(
                    "per_source_byte_limit must be at least one rotation".into(),
                ));
            }
        }
        Ok(())
    }

    /// Number of sectors the pool holds.
    pub fn sector_count(&self) -> usize {
        self.pool_bytes / SECTOR_PAYLOAD_BYTES
    }
}
