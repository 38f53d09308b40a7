//! # Common Components
//!
//! Shared utilities used by the hand-off client, the stub service and the binaries.
//!
//! ## Modules
//!
//! - [`config`]: Configuration structures, TOML loading and environment overrides
//! - [`logging`]: `env_logger` setup shared by both binaries

pub mod config;
pub mod logging;
