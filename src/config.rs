// Configuration: state directory, transfer tuning and backend list
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::retry::RetryPolicy;

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default chunk size ceiling: 60 MiB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 60 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the index database
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Whether content already hosted on one backend may be uploaded to another
    #[serde(default)]
    pub allow_duplicate_across_backends: bool,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Chunking, retry and parallelism settings for transfer sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Chunk size used when neither the policy nor the backend picks one
    pub chunk_size: u64,
    /// Ceiling applied to every chunk size
    pub max_chunk_size: u64,
    /// Attempts per chunk before the session gives up on it
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Chunks in flight per session; 1 uploads sequentially
    pub parallel_chunks: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            parallel_chunks: 1,
        }
    }
}

impl TransferSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// Which provider implementation serves a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Memory,
}

/// One configured backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    /// Preferred chunk size for this backend
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// Chunk sizes are rounded down to a multiple of this
    #[serde(default = "default_chunk_alignment")]
    pub chunk_alignment: u64,
    /// Storage directory (local backends)
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Base URL that serves `root`; links fall back to `file://` without it
    #[serde(default)]
    pub public_url: Option<String>,
    /// Byte quota (memory backends)
    #[serde(default)]
    pub quota: Option<u64>,
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ferry")
}

fn default_max_object_size() -> u64 {
    u64::MAX
}

fn default_chunk_alignment() -> u64 {
    1
}

impl Config {
    /// Load configuration with the following priority:
    /// 1. FERRY_CONFIG environment variable (path to a TOML file)
    /// 2. ~/.config/ferry/config.toml
    /// 3. Default: a single local backend under the state directory
    ///
    /// FERRY_HOME overrides the state directory in every case.
    pub async fn load() -> Result<Self> {
        Self::load_from(
            std::env::var_os("FERRY_CONFIG").map(PathBuf::from),
            std::env::var_os("FERRY_HOME").map(PathBuf::from),
        )
        .await
    }

    /// An explicit config path must exist; only the implicit one may be absent
    async fn load_from(explicit: Option<PathBuf>, home: Option<PathBuf>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                if !fs::try_exists(&path).await.unwrap_or(false) {
                    anyhow::bail!("FERRY_CONFIG points at {}, which does not exist", path.display());
                }
                Self::from_file(&path).await?
            }
            None => match Self::config_file_path() {
                Some(path) if path.exists() => Self::from_file(&path).await?,
                _ => Self::default(),
            },
        };

        if let Some(home) = home {
            config.state_dir = home;
        }
        if config.backends.is_empty() {
            config.backends.push(Self::default_backend(&config.state_dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the config file path (~/.config/ferry/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ferry").join("config.toml"))
    }

    fn default_backend(state_dir: &Path) -> BackendConfig {
        BackendConfig {
            id: "local".to_string(),
            kind: BackendKind::Local,
            priority: 0,
            max_object_size: default_max_object_size(),
            chunk_size: None,
            chunk_alignment: default_chunk_alignment(),
            root: Some(state_dir.join("share")),
            public_url: None,
            quota: None,
        }
    }

    /// Reject settings the transfer core cannot work with
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                anyhow::bail!("Duplicate backend id in config: {}", backend.id);
            }
            if backend.kind == BackendKind::Local && backend.root.is_none() {
                anyhow::bail!("Local backend {} has no root directory", backend.id);
            }
            if backend.chunk_alignment == 0 || backend.chunk_size == Some(0) {
                anyhow::bail!("Backend {} has a zero chunk size or alignment", backend.id);
            }
            if backend.max_object_size == 0 {
                anyhow::bail!("Backend {} has a zero max_object_size", backend.id);
            }
        }

        let transfer = &self.transfer;
        if transfer.chunk_size == 0 || transfer.max_chunk_size == 0 {
            anyhow::bail!("Transfer chunk sizes must be non-zero");
        }
        if transfer.max_attempts == 0 {
            anyhow::bail!("Transfer max_attempts must be at least 1");
        }
        if transfer.parallel_chunks == 0 {
            anyhow::bail!("Transfer parallel_chunks must be at least 1");
        }

        Ok(())
    }

    /// Get the index database path
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("index.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            allow_duplicate_across_backends: false,
            transfer: TransferSettings::default(),
            backends: Vec::new(),
        }
    }
}
