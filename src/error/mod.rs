//! Error types and Result aliases for treewatch.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using treewatch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for treewatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Directory watching error.
    #[error("watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Glob pattern error.
    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Directory watcher errors.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to watch a root path.
    #[error("failed to watch path '{path}': {reason}")]
    WatchFailed { path: String, reason: String },

    /// The native layer refused to register a directory.
    #[error("failed to register directory '{}': {reason}", path.display())]
    RegistrationFailed { path: PathBuf, reason: String },

    /// A subscriber callback returned an error or panicked.
    #[error("subscriber {subscriber} failed for '{}': {reason}", path.display())]
    CallbackFailed {
        subscriber: u64,
        path: PathBuf,
        reason: String,
    },

    /// The native event channel has been closed.
    #[error("watch channel closed")]
    ChannelClosed,

    /// Operation does not match the service's execution mode.
    #[error("operation requires {expected} mode, service runs in {actual} mode")]
    ModeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The service or watch root has already been closed.
    #[error("watcher closed")]
    Closed,
}

/// Glob pattern errors.
#[derive(Error, Debug)]
pub enum PatternError {
    /// The pattern could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },

    /// The pattern uses syntax this matcher does not support.
    #[error("unsupported pattern '{pattern}': {reason}")]
    Unsupported { pattern: String, reason: String },
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl WatcherError {
    /// Create a watch-failed error for a root path.
    pub fn watch_failed(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::WatchFailed {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

impl PatternError {
    /// Create an invalid-pattern error.
    pub fn invalid(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}
