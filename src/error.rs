//! Error types for the intent operator

use thiserror::Error;

/// Main error type for reconciliation and startup
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (create calls, client construction)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The local Job cache could not answer an existence check
    #[error("cache error: {0}")]
    Cache(String),

    /// Object is missing metadata required to build its dependents
    #[error("malformed object: {0}")]
    MalformedObject(String),

    /// The parent Job reached the Failed phase, so no dependents are created
    #[error("parent job {namespace}/{name} failed, not creating dependent jobs")]
    ParentJobFailed {
        /// Namespace of the failed Job
        namespace: String,
        /// Name of the failed Job
        name: String,
    },

    /// Startup configuration error (kubeconfig, client options)
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a cache error with the given message
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a malformed object error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedObject(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the same event could change the outcome.
    ///
    /// Backend and cache failures are transient. A malformed object or a
    /// Job that already failed stays that way no matter how often it is
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Cache(_) => true,
            Self::MalformedObject(_) | Self::ParentJobFailed { .. } | Self::Config(_) => false,
        }
    }

    /// True when the API server rejected a create because the object exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}
