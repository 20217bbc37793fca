//! # Docket Common
//!
//! Shared building blocks for the Docket offline engine.
//!
//! ## Features
//!
//! - Unified error type for configuration failures
//! - Logging configuration and setup
//! - Engine configuration loaded from JSON
//! - A clock abstraction so freshness checks can be tested

use thiserror::Error;

pub mod clock;
pub mod config;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EducationConfig, EngineConfig, NotificationDefaults, RouteConfig, StorageConfig, CONFIG_ENV,
    QUEUE_PARTITION,
};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for configuration and shared plumbing.
#[derive(Error, Debug)]
pub enum DocketError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DocketError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            DocketError::Config { .. } => "config",
            DocketError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for shared operations.
pub type Result<T> = std::result::Result<T, DocketError>;
