//! Error types for texrun-core.
//!
//! Every variant here is fatal for the whole invocation. Failures local to
//! one execution unit are reported through [`crate::report::Diagnostics`]
//! instead, so that one session cannot abort the others.

use thiserror::Error;

/// Result type for texrun-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum Error {
    /// The code file is missing or cannot be split into records and settings.
    #[error("code file error: {0}")]
    CodeFile(String),

    /// A malformed code record.
    #[error("invalid code record: {0}")]
    Record(String),

    /// The settings block is unusable (bad value, version mismatch).
    #[error("settings error: {0}")]
    Settings(String),

    /// An engine template, wrapper or substitution string is malformed.
    #[error("template error: {0}")]
    Template(String),

    /// A record names a family that has no registered engine.
    #[error("unknown code family: {0}")]
    UnknownFamily(String),

    /// An interpreter could not be started, even through the shell.
    #[error("failed to launch {command}: {message}")]
    Launch { command: String, message: String },

    /// The persisted run state could not be written or read.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Invalid command-line request (bad selector, bad interpreter map).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker pool could not be created.
    #[error("worker pool error: {0}")]
    Pool(String),
}
