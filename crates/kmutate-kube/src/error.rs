//! Error types for kmutate-kube

use std::time::Duration;

use kmutate_core::{CoreError, ResourceIdentity};
use thiserror::Error;

/// Result type for kmutate-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors surfaced by the executor, the readiness waiter and the stores
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Resource does not exist
    #[error("{kind} '{identity}' not found")]
    NotFound {
        kind: String,
        identity: ResourceIdentity,
    },

    /// Create lost a race with another writer
    #[error("{kind} '{identity}' already exists")]
    AlreadyExists {
        kind: String,
        identity: ResourceIdentity,
    },

    /// Resource version advanced since it was read
    #[error("conflict writing {kind} '{identity}': {message}")]
    Conflict {
        kind: String,
        identity: ResourceIdentity,
        message: String,
    },

    /// Retry budget used up
    #[error("failed to {operation} {kind} '{identity}' after {attempts} attempt(s): {source}")]
    RetryExhausted {
        kind: String,
        identity: ResourceIdentity,
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<KubeError>,
    },

    /// Readiness predicate never held within the policy bound
    #[error("{kind} '{identity}' not ready after {elapsed:?} ({polls} poll(s))")]
    Timeout {
        kind: String,
        identity: ResourceIdentity,
        elapsed: Duration,
        polls: u32,
    },

    /// Cancel token fired while waiting
    #[error("operation on '{identity}' cancelled after {attempts} attempt(s)")]
    Cancelled {
        identity: ResourceIdentity,
        attempts: u32,
    },

    /// Transform renamed or moved the resource
    #[error("transform changed resource identity from '{expected}' to '{actual}'")]
    IdentityMismatch {
        expected: ResourceIdentity,
        actual: ResourceIdentity,
    },

    /// Snapshot could not be normalized or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed patch or pointer
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Any other store failure
    #[error("store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<CoreError> for KubeError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Serialization(msg) => KubeError::Serialization(msg),
            CoreError::InvalidPolicy(msg) => KubeError::InvalidConfig(msg),
            other => KubeError::InvalidPatch(other.to_string()),
        }
    }
}

impl KubeError {
    /// Check if the resource was missing (typed or raw 404)
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::NotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this is a version conflict (typed or raw 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            KubeError::Conflict { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether the retry loops try again after this error
    ///
    /// Everything except missing resources and local failures is retried,
    /// including errors that are plausibly permanent (403, 422). Callers that
    /// need to fail fast on those should use a tight attempt bound.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            KubeError::NotFound { .. }
                | KubeError::AlreadyExists { .. }
                | KubeError::Cancelled { .. }
                | KubeError::IdentityMismatch { .. }
                | KubeError::Serialization(_)
                | KubeError::InvalidPatch(_)
                | KubeError::InvalidConfig(_)
                | KubeError::RetryExhausted { .. }
                | KubeError::Timeout { .. }
        ) && !self.is_not_found()
    }

    /// Error that ended a retry loop, unwrapping `RetryExhausted`
    pub fn root_cause(&self) -> &KubeError {
        match self {
            KubeError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
