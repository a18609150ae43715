//! Server configuration.
//!
//! Everything has a default, so an empty or partial TOML file is valid:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/weave"
//!
//! [execution]
//! max_concurrent = 8
//! timeout_secs = 5
//! ```
//!
//! `WEAVE_BIND_ADDR` and `WEAVE_STORAGE_PATH` override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::exec::{default_languages, Isolation, LanguageSpec, ResourceLimits};
use crate::presence::DEFAULT_PALETTE;

pub const ENV_CONFIG: &str = "WEAVE_CONFIG";
pub const ENV_BIND_ADDR: &str = "WEAVE_BIND_ADDR";
pub const ENV_STORAGE_PATH: &str = "WEAVE_STORAGE_PATH";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Presence colors, handed out in order
    pub palette: Vec<String>,
    pub execution: ExecutionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WEAVE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|v| !v.is_empty()) {
            self.bind_addr = addr;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH).filter(|v| !v.is_empty()) {
            self.storage_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_addr must not be empty".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be at least 1".into()));
        }
        self.execution.validate()
    }
}

/// Execution pool and sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Root for per-request ephemeral directories
    pub work_dir: PathBuf,
    /// Requests running at once
    pub max_concurrent: usize,
    /// Requests waiting for a slot before new ones are rejected
    pub max_queued: usize,
    /// Admitted requests per room (0 = no per-room limit)
    pub per_room_limit: usize,
    pub timeout_secs: u64,
    /// Cap on captured stdout and stderr, each
    pub max_output_bytes: usize,
    pub limits: ResourceLimits,
    pub isolation: Isolation,
    /// `PATH` given to programs
    pub path_env: String,
    pub languages: Vec<LanguageSpec>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("weave-exec"),
            max_concurrent: 4,
            max_queued: 16,
            per_room_limit: 2,
            timeout_secs: 10,
            max_output_bytes: 64 * 1024,
            limits: ResourceLimits::default(),
            isolation: Isolation::default(),
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            languages: default_languages(),
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("execution.max_concurrent must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("execution.timeout_secs must be at least 1".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid("execution.max_output_bytes must be at least 1".into()));
        }
        Ok(())
    }
}
