//! Configuration settings and validation.

use crate::{Error, Result};

/// Upper bound on worker threads for one service.
pub const MAX_WORKER_THREADS: usize = 64;

/// How a service consumes its native event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The caller drives the loop by calling `poll()`.
    Polling,
    /// Worker threads block on the channel.
    ThreadPool {
        /// Number of worker threads.
        threads: usize,
    },
}

impl ExecutionMode {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::ThreadPool { .. } => "thread-pool",
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::ThreadPool { threads: 1 }
    }
}

/// Main configuration for a watch service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Execution model for the event loop.
    pub mode: ExecutionMode,

    /// Separator used when compiling globs and rendering probed paths.
    /// `None` means the platform separator.
    pub separator: Option<char>,

    /// Log level for [`crate::observability::init_tracing`].
    ///
    /// One of trace, debug, info, warn or error, in any case.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            separator: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a polling configuration.
    #[must_use]
    pub fn polling() -> Self {
        Self {
            mode: ExecutionMode::Polling,
            ..Self::default()
        }
    }

    /// Create a thread-pool configuration.
    #[must_use]
    pub fn thread_pool(threads: usize) -> Self {
        Self {
            mode: ExecutionMode::ThreadPool { threads },
            ..Self::default()
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if let ExecutionMode::ThreadPool { threads } = self.mode {
            validate_threads(threads)?;
        }

        if let Some(separator) = self.separator {
            validate_separator(separator)?;
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Separator in effect for this configuration.
    #[must_use]
    pub fn effective_separator(&self) -> char {
        self.separator.unwrap_or(std::path::MAIN_SEPARATOR)
    }
}

/// Validate a worker thread count.
///
/// # Errors
///
/// Returns an error if the count is zero or above [`MAX_WORKER_THREADS`].
pub fn validate_threads(threads: usize) -> Result<()> {
    if threads == 0 {
        return Err(Error::config("threads cannot be 0"));
    }

    if threads > MAX_WORKER_THREADS {
        return Err(Error::config(format!(
            "threads cannot exceed {MAX_WORKER_THREADS}"
        )));
    }

    Ok(())
}

/// Validate a glob separator character.
///
/// # Errors
///
/// Returns an error if the separator would be ambiguous inside a glob.
pub fn validate_separator(separator: char) -> Result<()> {
    if separator.is_alphanumeric() || separator.is_whitespace() {
        return Err(Error::config(format!(
            "separator '{separator}' must not be alphanumeric or whitespace"
        )));
    }

    if matches!(separator, '*' | '?' | '.') {
        return Err(Error::config(format!(
            "separator '{separator}' clashes with glob syntax"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.mode, ExecutionMode::ThreadPool { threads: 1 });
        assert_eq!(config.separator, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_constructors() {
        assert_eq!(ServiceConfig::polling().mode, ExecutionMode::Polling);
        assert_eq!(
            ServiceConfig::thread_pool(4).mode,
            ExecutionMode::ThreadPool { threads: 4 }
        );
        assert!(ServiceConfig::new().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_threads() {
        let config = ServiceConfig::thread_pool(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn test_validate_too_many_threads() {
        let config = ServiceConfig::thread_pool(100);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn test_polling_ignores_thread_limits() {
        assert!(ServiceConfig::polling().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = ServiceConfig {
            log_level: "invalid".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log level"));
    }

    #[test]
    fn test_log_level_case_insensitive() {
        for level in ["TRACE", "Debug", "INFO", "Warn", "ERROR"] {
            let config = ServiceConfig {
                log_level: level.to_string(),
                ..Default::default()
            };
            assert!(
                config.validate().is_ok(),
                "Level '{level}' should be valid (case insensitive)"
            );
        }
    }

    #[test]
    fn test_validate_separator() {
        for sep in ['/', '\\', ':', '|'] {
            assert!(validate_separator(sep).is_ok(), "'{sep}' should be valid");
        }
        for sep in ['a', '7', ' ', '*', '?', '.'] {
            assert!(validate_separator(sep).is_err(), "'{sep}' should be rejected");
        }
    }

    #[test]
    fn test_effective_separator() {
        let config = ServiceConfig {
            separator: Some(':'),
            ..Default::default()
        };
        assert_eq!(config.effective_separator(), ':');
        assert_eq!(
            ServiceConfig::default().effective_separator(),
            std::path::MAIN_SEPARATOR
        );
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ExecutionMode::Polling.name(), "polling");
        assert_eq!(ExecutionMode::ThreadPool { threads: 2 }.name(), "thread-pool");
    }
}
