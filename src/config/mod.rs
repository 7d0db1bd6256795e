//! Configuration management for treewatch.
//!
//! Supports configuration from:
//! - Command-line arguments (highest priority)
//! - Environment variables
//! - Built-in defaults (lowest priority)

mod settings;

pub use settings::{
    validate_separator, validate_threads, ExecutionMode, ServiceConfig, MAX_WORKER_THREADS,
};
