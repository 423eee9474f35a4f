//! Daemon configuration
//!
//! Stored as JSON (default `~/.dfpeer/config.json`). Every field has a
//! default, so partial files are fine.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub node: NodeConfig,
    pub sync: SyncConfig,
    pub membership: MembershipConfig,
    pub storage: StorageConfig,
}

/// Identity advertised to the manager and to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Generated on startup when absent
    pub id: Option<String>,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub cluster_id: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            ip: "127.0.0.1".to_string(),
            port: 4000,
            cluster_id: 1,
        }
    }
}

impl NodeConfig {
    /// Configured id, or a fresh short uuid
    pub fn resolve_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()[..8].to_string())
    }
}

/// Piece Sync Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Unacknowledged piece transfers per direction per session.
    /// 1 keeps a single transfer outstanding; larger values pipeline.
    pub window: usize,
    pub request_timeout_ms: u64,
    /// Must not be shorter than `request_timeout_ms`
    pub idle_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: 1,
            request_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_ms),
            max: Duration::from_millis(self.max_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Keepalive with the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub heartbeat_interval_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `None` keeps pieces in memory
    pub dir: Option<PathBuf>,
    pub piece_length: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            piece_length: 4 * 1024 * 1024,
        }
    }
}

impl DaemonConfig {
    /// Config file path (~/.dfpeer/config.json)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dfpeer")
            .join("config.json")
    }

    /// Load from disk; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::info!("Config saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.window == 0 {
            bail!("sync.window must be at least 1");
        }
        if self.sync.request_timeout_ms == 0 || self.sync.idle_timeout_ms == 0 {
            bail!("sync timeouts must be non-zero");
        }
        if self.sync.idle_timeout_ms < self.sync.request_timeout_ms {
            bail!("sync.idle_timeout_ms must be at least sync.request_timeout_ms");
        }
        if self.membership.heartbeat_interval_ms == 0 {
            bail!("membership.heartbeat_interval_ms must be non-zero");
        }
        let backoff = &self.membership.backoff;
        if backoff.initial_ms == 0 || backoff.max_ms < backoff.initial_ms {
            bail!("membership.backoff needs 0 < initial_ms <= max_ms");
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            bail!("membership.backoff.jitter must lie in [0, 1)");
        }
        if backoff.multiplier <= 1.0 + backoff.jitter {
            bail!("membership.backoff.multiplier must exceed 1 + jitter");
        }
        if self.storage.piece_length == 0 {
            bail!("storage.piece_length must be non-zero");
        }
        Ok(())
    }
}
