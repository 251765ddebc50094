//! Error types for the Postgres Cluster Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A write against the API server, wrapped with the operation and the
    /// key of the resource it targeted
    #[error("{operation} failed for {key}: {source}")]
    Patch {
        operation: &'static str,
        key: String,
        #[source]
        source: kube::Error,
    },

    /// The resource has no resourceVersion, so a conditional patch cannot
    /// be built for it
    #[error("resource {0} has no resourceVersion")]
    MissingResourceVersion(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Wrap a Kubernetes write error with its operation and target key
    pub fn patch(operation: &'static str, key: impl Into<String>, source: kube::Error) -> Self {
        Error::Patch {
            operation,
            key: key.into(),
            source,
        }
    }

    /// An optimistic-lock version mismatch. Retryable: the caller should
    /// re-observe the resource and try again.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(e) => is_kube_conflict(e),
            Error::Patch { source, .. } => is_kube_conflict(source),
            _ => false,
        }
    }
}

fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Whether a Kubernetes API error is a 404. Deletion steps treat this as
/// success: the target being already gone is the desired outcome.
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}
