//! Error types for extraction, generation, and event handling

use thiserror::Error;

/// Result type alias for varinject operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while extracting pages or serving agents
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad, missing, or oversized input (never retried)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Navigation or serialization of a page failed
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Navigation did not finish within the configured budget
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Unknown experiment, variant, or registry key
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tracking event could not be delivered
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Network error outside of page navigation
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status code used when the error crosses the HTTP surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Delivery(_) => 502,
            Error::Extraction(_)
            | Error::Timeout(_)
            | Error::Network(_)
            | Error::Config(_)
            | Error::Other(_) => 500,
        }
    }

    /// Stable tag for structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Extraction(_) | Error::Timeout(_) => "extraction_error",
            Error::NotFound(_) => "not_found",
            Error::Delivery(_) => "delivery_error",
            Error::Network(_) => "network_error",
            Error::Config(_) => "config_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Extraction(_) | Error::Timeout(_) | Error::Network(_) | Error::Delivery(_)
        )
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Extraction(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Extraction(format!("malformed structure payload: {}", err))
    }
}
