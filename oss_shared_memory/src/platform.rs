//! Platform-specific helpers

pub mod linux;

pub use linux::*;
