//! Kernel configuration.
//!
//! The kernel is a library — the CLI/config *surface* is delegated to
//! collaborators (§6) — but embedders still need a typed place to put
//! tunables instead of scattering constants through the crate. This mirrors
//! the teacher crate's `CoreConfig`/`MemoryConfig` shape: plain,
//! `Default`-derived structs, optionally loaded from TOML.
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tessella store tunables.
    pub store: StoreConfig,
    /// Sync protocol tunables.
    pub sync: SyncConfig,
    /// Cron ticker tunables.
    pub cron: CronConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            cron: CronConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parse a `KernelConfig` from a TOML document.
    pub fn from_toml_str(contents: &str) -> KernelResult<Self> {
        toml::from_str(contents).map_err(|e| KernelError::SchemaInvalid {
            reason: format!("invalid kernel config: {e}"),
        })
    }

    /// Serialize a `KernelConfig` back to TOML (useful for writing a
    /// starter config file for embedders).
    pub fn to_toml_string(&self) -> KernelResult<String> {
        toml::to_string_pretty(self).map_err(|e| KernelError::SchemaInvalid {
            reason: format!("could not serialize kernel config: {e}"),
        })
    }
}

/// Tessella store tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Soft cap on tessellae materialized per `replay` call before a
    /// warning is logged (0 = unlimited). This does not truncate results;
    /// it only flags res whose history is growing unusually large.
    pub replay_warn_threshold: usize,
    /// Default page size for `list_entities` when no `limit` is supplied.
    pub default_list_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replay_warn_threshold: 10_000,
            default_list_limit: 100,
        }
    }
}

/// Sync protocol tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum tessellae returned in a single pull response (0 = unlimited).
    pub max_pull_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pull_batch: 5_000,
        }
    }
}

/// Cron ticker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Tick cadence in seconds for the background ticker (§5: "60-second
    /// cadence on a dedicated task").
    pub tick_interval_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
        }
    }
}
