//! Prelude module for common re-exports.
//!
//! ```rust
//! use oss_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::{LogConfig, LogLevel};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, IpcConfig, OssConfig, SharedConfig};

// ─── Roles ──────────────────────────────────────────────────────────
pub use crate::role::ProcessRole;

// ─── Ledger sizing ──────────────────────────────────────────────────
pub use crate::consts::{INSTANCES_PER_RESOURCE, MAX_RESOURCES, MAX_USER_PROCESSES};
