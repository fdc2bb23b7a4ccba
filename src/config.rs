//! Engine configuration (spec §6 "Configuration keys").
//!
//! Loaded from TOML — a layered `scratch`/`persistent`/`meta` directory
//! engine is ordinarily driven by a checked-in config file, not a request
//! body.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Dispatch mode for client commands (spec §4.1, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// `checkpoint`/`restart` run inline on the calling thread via the
    /// orchestrator.
    Sync,
    /// `checkpoint`/`restart` are dispatched through the request queue to
    /// the backend worker.
    Async,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Sync
    }
}

/// The storage backend used for the L4 flush (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Per-rank POSIX copy into `persistent/`.
    Posix,
    /// Collective write into one shared object with per-rank offsets.
    Mpi,
    /// Library-managed parallel writer (aggregated, single object + index).
    Library,
}

impl Default for IoMode {
    fn default() -> Self {
        IoMode::Posix
    }
}

/// Engine configuration, deserialized from a TOML file (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fast, node-local, non-durable staging directory. Required.
    pub scratch: PathBuf,
    /// Durable directory backing L4. Required.
    pub persistent: PathBuf,
    /// Metadata root; defaults to `<scratch>/meta` when absent.
    pub meta: Option<PathBuf>,
    /// Dispatch mode.
    #[serde(default)]
    pub mode: Mode,
    /// Maximum number of worker tasks the backend runs concurrently.
    /// Defaults to the host's logical core count.
    pub max_parallelism: Option<usize>,
    /// Whether the checksum dispatch module runs.
    #[serde(default = "default_true")]
    pub chksum: bool,
    /// Seconds of client silence before the watchdog module marks it dead.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: u64,
    /// Maximum persistent versions retained per name.
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    /// Maximum scratch (L1/L2/L3) versions retained per name.
    #[serde(default = "default_scratch_versions")]
    pub scratch_versions: usize,
    /// How many checkpoints between L3 erasure-coding passes (1 = every
    /// checkpoint).
    #[serde(default = "default_ec_interval")]
    pub ec_interval: u32,
    /// Bulk-transfer chunk size in bytes, used by pluggable transfer
    /// backends (out of scope here beyond the config key itself).
    #[serde(default = "default_transfer_size")]
    pub transfer_size: u64,
    /// Reed-Solomon block size in bytes; must be a positive multiple of 2
    /// (word size 16 bits). Default 1 MiB, clamped to [64 KiB, 2 MiB] per
    /// spec §4.5.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// L4 flush strategy.
    #[serde(default)]
    pub io_mode: IoMode,
    /// Name of the failure-domain key used to build the group ring
    /// (spec §4 topology); purely informational here since node id
    /// assignment is supplied by the caller.
    pub failure_domain: Option<String>,
    /// Opaque passthrough for pluggable bulk-transfer backends (out of
    /// scope; kept so config files round-trip unmodified).
    pub axl_type: Option<String>,
    /// Opaque passthrough for a DAOS-backed storage module (out of scope).
    pub daos_pool_uuid: Option<String>,
    /// Opaque passthrough for a DAOS-backed storage module (out of scope).
    pub daos_cont_uuid: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_watchdog_interval() -> u64 {
    60
}
fn default_max_versions() -> usize {
    2
}
fn default_scratch_versions() -> usize {
    2
}
fn default_ec_interval() -> u32 {
    1
}
fn default_transfer_size() -> u64 {
    16 * 1024 * 1024
}
fn default_block_size() -> u64 {
    1024 * 1024
}

const MIN_BLOCK_SIZE: u64 = 64 * 1024;
const MAX_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

impl EngineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|e| EngineError::ConfigInvalid(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate required keys and directory reachability, clamping
    /// soft-bounded values in place.
    pub fn validate(&self) -> EngineResult<()> {
        if self.scratch.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid("`scratch` is required".into()));
        }
        if self.persistent.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid(
                "`persistent` is required".into(),
            ));
        }
        if self.block_size == 0 || self.block_size % 2 != 0 {
            return Err(EngineError::ConfigInvalid(
                "`block_size` must be a positive even number of bytes".into(),
            ));
        }
        Ok(())
    }

    /// Block size clamped into the spec's documented [64 KiB, 2 MiB] range.
    pub fn effective_block_size(&self) -> u64 {
        self.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
    }

    /// Metadata root directory, defaulting to `<scratch>/meta`.
    pub fn meta_dir(&self) -> PathBuf {
        self.meta.clone().unwrap_or_else(|| self.scratch.join("meta"))
    }

    /// Resolved worker concurrency cap.
    pub fn effective_max_parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(num_cpus::get)
    }

    /// Ensure `scratch`, `persistent`, and `meta` exist, creating them if
    /// necessary. Mirrors VELOC's init-time directory bootstrap.
    pub fn ensure_dirs(&self) -> EngineResult<()> {
        for dir in [&self.scratch, &self.persistent, &self.meta_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        for sub in ["tmp", "l1", "l2", "l3"] {
            std::fs::create_dir_all(self.scratch.join(sub))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_required_keys() {
        let toml = r#"
            persistent = "/tmp/persistent"
        "#;
        let err = toml::from_str::<EngineConfig>(toml);
        assert!(err.is_err(), "scratch is required by the schema");
    }

    #[test]
    fn clamps_block_size() {
        let mut cfg = minimal_config();
        cfg.block_size = 16;
        assert_eq!(cfg.effective_block_size(), MIN_BLOCK_SIZE);
        cfg.block_size = 8 * 1024 * 1024;
        assert_eq!(cfg.effective_block_size(), MAX_BLOCK_SIZE);
    }

    fn minimal_config() -> EngineConfig {
        EngineConfig {
            scratch: PathBuf::from("/tmp/scratch"),
            persistent: PathBuf::from("/tmp/persistent"),
            meta: None,
            mode: Mode::Sync,
            max_parallelism: None,
            chksum: true,
            watchdog_interval: 60,
            max_versions: 2,
            scratch_versions: 2,
            ec_interval: 1,
            transfer_size: 1024,
            block_size: default_block_size(),
            io_mode: IoMode::Posix,
            failure_domain: None,
            axl_type: None,
            daos_pool_uuid: None,
            daos_cont_uuid: None,
        }
    }
}
