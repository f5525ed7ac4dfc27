//! Error types for Gatekeeper.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Every variant is raised while a limiter is being configured or started.
/// Admission decisions themselves never fail.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed rate string
    #[error("Invalid rate '{rate}': {reason}")]
    InvalidRate { rate: String, reason: String },

    /// A limiter could not be started
    #[error("Startup error: {0}")]
    Startup(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    pub(crate) fn invalid_rate(rate: &str, reason: impl Into<String>) -> Self {
        GatekeeperError::InvalidRate {
            rate: rate.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to the configuration class.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            GatekeeperError::Config(_) | GatekeeperError::InvalidRate { .. }
        )
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
