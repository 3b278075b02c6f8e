//! Configuration schema for blobmemo
//!
//! Configuration is stored at `~/.config/blobmemo/config.toml`

use crate::memo::OrphanPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Blob store settings
    pub store: StoreConfig,

    /// Memoization settings
    pub memo: MemoConfig,

    /// Lease lock settings
    pub lock: LockConfig,

    /// Execution shim settings
    pub shim: ShimConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Local disk store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store directory (default: `~/.local/share/blobmemo/store`)
    pub root: Option<PathBuf>,
}

/// Memoization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Namespace all memospace addresses live under
    pub root: String,

    /// Pipeline id used when none is given
    pub pipeline_id: String,

    /// How long a confirmed-missing control file is trusted (0 = disabled)
    pub negative_cache_ttl_secs: u64,

    /// Handling of invocations that never finished
    pub orphan_policy: OrphanPolicy,

    /// Hold the lease lock on an address while computing it
    pub lock_invocations: bool,

    /// How long to wait for another process computing the same address
    pub lock_wait_secs: u64,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            root: "memo".to_string(),
            pipeline_id: "default".to_string(),
            negative_cache_ttl_secs: 5,
            orphan_policy: OrphanPolicy::default(),
            lock_invocations: false,
            lock_wait_secs: 600,
        }
    }
}

/// Lease lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration in seconds
    pub expire_secs: f64,

    /// Write confirmation delay and clock-skew allowance in seconds
    pub acquire_margin_secs: f64,

    /// First polling delay while blocked
    pub poll_interval_ms: u64,

    /// Polling delay ceiling
    pub max_poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expire_secs: 30.0,
            acquire_margin_secs: 1.0,
            poll_interval_ms: 250,
            max_poll_interval_ms: 5000,
        }
    }
}

/// Where computations run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShimKind {
    /// Tokio task in the calling process
    #[default]
    Thread,
    /// One worker process per invocation
    Subprocess,
}

/// Execution shim settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    pub kind: ShimKind,

    /// Worker program (default: this executable)
    pub program: Option<PathBuf>,

    /// Arguments placed before the address
    pub args: Vec<String>,
}
