//! Unified error handling for the gateway core.
//!
//! A single crate-level error type keeps the modules from depending on each
//! other for error handling.

use thiserror::Error;

/// Unified error type for the gateway runtime core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Schema validation failures from a rejected reload
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// A route references a cluster the snapshot does not contain
    #[error("Route '{route_id}' references unknown cluster '{cluster_id}'")]
    UnknownCluster {
        route_id: String,
        cluster_id: String,
    },

    /// A route's matching rule could not be compiled
    #[error("Route '{route_id}' has an invalid matching rule: {reason}")]
    InvalidRouteRule { route_id: String, reason: String },

    /// Prober lifecycle misuse; indicates a reconciliation bug in the caller
    #[error("Prober for cluster '{0}' was already started")]
    ProberAlreadyStarted(String),

    /// A probe target that can never be checked (programming/config error)
    #[error("Invalid probe target '{target}': {reason}")]
    InvalidProbeTarget { target: String, reason: String },

    /// Network and I/O errors
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// YAML parse failures
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
