//! # Configuration
//!
//! `bassline.toml`, parsed into [`AppConfig`]. Every section and field is
//! optional; a missing file means all defaults.
//!
//! ```toml
//! [kernel]
//! max_history_size = 100
//! scheduler = "immediate"
//!
//! [storage]
//! backend = "redb"
//! path = "bassline.redb"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! ```

use crate::error::AppError;
use bassline_core::{Kernel, KernelConfig, MemoryStorage, RedbStorage, StorageDriver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when none is given.
pub const CONFIG_FILE_NAME: &str = "bassline.toml";

/// Largest config file accepted (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile; the network is lost on exit.
    Memory,
    /// ACID file database.
    #[default]
    Redb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Redb,
            path: PathBuf::from("bassline.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// APP CONFIG
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub kernel: KernelConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, AppError> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Load `path`, or `bassline.toml` in the working directory if present,
    /// or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(CONFIG_FILE_NAME);
                if !fallback.is_file() {
                    tracing::debug!("no {} found, using defaults", CONFIG_FILE_NAME);
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let metadata = std::fs::metadata(&path).map_err(|e| {
            AppError::Io(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(AppError::Config(format!(
                "Config file size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Io(format!("Read config: {}", e)))?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Open the configured storage backend.
    pub fn open_storage(&self) -> Result<Box<dyn StorageDriver>, AppError> {
        match self.storage.backend {
            StorageBackend::Memory => Ok(Box::new(MemoryStorage::new())),
            StorageBackend::Redb => Ok(Box::new(RedbStorage::open(&self.storage.path)?)),
        }
    }

    /// An initialized kernel over the configured storage.
    pub fn build_kernel(&self) -> Result<Kernel, AppError> {
        let storage = self.open_storage()?;
        let mut kernel = Kernel::with_storage(self.kernel.clone(), storage);
        kernel.initialize()?;
        Ok(kernel)
    }

    /// Default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Bassline kernel configuration

[kernel]
# Undo entries kept before the oldest is dropped
max_history_size = 100
# "immediate" (apply in the request) or "batch" (coalesce until the next tick)
scheduler = "immediate"
# scheduler_config = { windowMs = 16 }

[storage]
# "redb" (ACID file database) or "memory" (lost on exit)
backend = "redb"
path = "bassline.redb"

[server]
host = "127.0.0.1"
port = 8080
"#
    }
}

// =============================================================================
// TESTS
// =============================================================================
