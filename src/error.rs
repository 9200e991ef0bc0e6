//! Failure taxonomy for the linking pipeline.
//!
//! Library code raises a typed [`LinkError`]; orchestration code wraps it
//! with `anyhow` context. The variants stay downcastable through an
//! `anyhow::Error`, which is how the tests assert on failure kinds.

use thiserror::Error;

/// Failure kinds surfaced by the pool, matcher, harmonizer and process
/// controller.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed resource identity or duplicate pool entry.
    #[error("invalid resource: {0}")]
    Validation(String),

    /// A named thing (pool entry, platform) does not exist.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// The assembled image configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An exclusion specification could not be compiled.
    #[error("bad exclusion pattern: {0}")]
    Pattern(String),

    /// A child process could not be spawned.
    #[error("failed to launch '{command}'")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading a child process stream failed.
    #[error("stream capture failed: {0}")]
    Io(String),

    /// Waiting for a child process failed or was cancelled.
    #[error("wait failed: {0}")]
    Wait(String),
}
