//! # Cadence Common Library
//!
//! Shared code for the cadence playback crates:
//! - Configuration file resolution and TOML loading
//! - Common error type
//! - Logging bootstrap for binaries

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
