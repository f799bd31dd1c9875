//! Error types for cadence-player
//!
//! Usage errors (wrong thread, double initialize, reading an empty decoder)
//! are assertions, not variants here. This enum covers what a caller can
//! actually recover from or report.

use thiserror::Error;

/// Main error type for cadence-player
#[derive(Error, Debug)]
pub enum Error {
    /// Shared configuration/loading errors
    #[error(transparent)]
    Common(#[from] cadence_common::Error),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread spawn and other OS-level I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Native pipeline refused a state change or reported a failure
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// A sample could not be turned into decoded output
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stream format the decoder cannot handle
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Frame handle whose slot has been released or reused
    #[error("Stale frame handle: {0}")]
    StaleHandle(String),
}

/// Convenience Result type using cadence-player Error
pub type Result<T> = std::result::Result<T, Error>;
