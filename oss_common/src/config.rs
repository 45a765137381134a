//! Configuration loading traits and types.
//!
//! Every OSS process (coordinator, timekeeper, workers and the `oss_ipcctl`
//! tool) must agree on the IPC reference paths and the semaphore name, so
//! they all read the same TOML file through [`ConfigLoader`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use oss_common::config::{ConfigLoader, OssConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = OssConfig::load(Path::new("oss.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{CLOCK_SEM_NAME, DEFAULT_LOG_FILE_NAME, DEFAULT_MSG_PATH, DEFAULT_SHM_PATH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Levels are totally ordered: `Annoy < Debug < Info < Warn < Error`.
/// Uses lowercase serde values for TOML compatibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-operation chatter (semaphore acquire/release and the like).
    Annoy,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

/// Common configuration fields shared across all OSS processes.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "oss"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Simulation instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: "oss".to_string(),
        }
    }
}

/// Where the shared IPC objects live.
///
/// All attaching processes derive the same keys from these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpcConfig {
    /// Reference path for the shared memory keys.
    #[serde(default = "default_shm_path")]
    pub key_path: PathBuf,

    /// Reference path for the message queue key.
    #[serde(default = "default_msg_path")]
    pub msg_key_path: PathBuf,

    /// Name of the semaphore gating the clock segments.
    #[serde(default = "default_clock_semaphore")]
    pub clock_semaphore: String,
}

impl IpcConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a key path is empty or the
    /// semaphore name is not of the form `/name`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_path.as_os_str().is_empty() || self.msg_key_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "IPC key paths cannot be empty".to_string(),
            ));
        }
        let name = self.clock_semaphore.as_str();
        if name.len() < 2 || !name.starts_with('/') || name[1..].contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "clock_semaphore '{name}' must look like '/name'"
            )));
        }
        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            key_path: default_shm_path(),
            msg_key_path: default_msg_path(),
            clock_semaphore: default_clock_semaphore(),
        }
    }
}

/// Log sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Minimum level written; anything below is dropped before formatting.
    #[serde(default)]
    pub level: LogLevel,

    /// Log file mirrored next to stderr. `None` disables the file sink.
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Stderr-only logging at the given level.
    pub fn console(level: LogLevel) -> Self {
        Self { level, file: None }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file: default_log_file(),
        }
    }
}

/// Complete configuration file of an OSS instance.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "oss"
/// log_level = "info"
///
/// [ipc]
/// key_path = "/tmp"
/// msg_key_path = "/tmp"
/// clock_semaphore = "/simClockSem"
///
/// [log]
/// file = "oss.log"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OssConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,

    /// IPC object locations.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Log sink.
    #[serde(default)]
    pub log: LogConfig,
}

impl OssConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.ipc.validate()
    }

    /// Log configuration with the `[shared]` level applied.
    ///
    /// `[shared] log_level` is the instance-wide knob; it wins over the
    /// `[log]` section level when it is more verbose.
    pub fn effective_log(&self) -> LogConfig {
        LogConfig {
            level: self.log.level.min(self.shared.log_level),
            file: self.log.file.clone(),
        }
    }

    /// Load from `path` if given, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_shm_path() -> PathBuf {
    PathBuf::from(DEFAULT_SHM_PATH)
}

fn default_msg_path() -> PathBuf {
    PathBuf::from(DEFAULT_MSG_PATH)
}

fn default_clock_semaphore() -> String {
    CLOCK_SEM_NAME.to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_LOG_FILE_NAME))
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
