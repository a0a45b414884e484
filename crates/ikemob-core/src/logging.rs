//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Log levels accepted in configuration
pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Whether `level` is one of `VALID_LOG_LEVELS`
    #[must_use]
    pub fn is_valid(&self) -> bool {
        VALID_LOG_LEVELS.contains(&self.level.to_lowercase().as_str())
    }

    /// Filter from `RUST_LOG`, falling back to the configured level
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Install the global fmt subscriber.
///
/// Safe to call more than once; returns `false` if a subscriber was already set.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .try_init()
        .is_ok()
}
