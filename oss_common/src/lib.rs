//! OSS Common Library
//!
//! This crate provides the constants, process roles and configuration
//! loading utilities shared by every process of the operating-system
//! simulation: the coordinator, the timekeeper and the workers.
//!
//! # Module Structure
//!
//! - [`consts`] - IPC keys, project ids and ledger sizing (build-time)
//! - [`role`] - Logical role of the running process
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! oss_common = { path = "../oss_common" }
//! ```
//!
//! ```rust
//! use oss_common::consts::*;
//! use oss_common::config::{ConfigLoader, OssConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod role;
