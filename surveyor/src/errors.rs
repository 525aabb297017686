//! Error taxonomy for the discovery engine.
//!
//! Responsibilities:
//! - Distinguish the handful of failure classes the retry policy cares
//!   about (timeout vs transient vs malformed vs persistence vs fatal).
//! - Keep conversions from io/serde errors in one place.

use thiserror::Error;

/// Error type shared by all discovery components.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The remote query exceeded the API's execution budget. Degradable.
    #[error("query exceeded remote execution budget: {0}")]
    Timeout(String),
    /// Network-level or 5xx-class failure. Retryable unchanged.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Response body could not be decoded. Treated as an empty result.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Checkpoint save/load failure. Logged, never aborts the session.
    #[error("persistence failure: {0}")]
    Persistence(String),
    /// Unusable configuration or credentials. Aborts the whole session.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

impl DiscoveryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DiscoveryError::Timeout(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DiscoveryError::FatalConfig(_))
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        DiscoveryError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Persistence(e.to_string())
    }
}
