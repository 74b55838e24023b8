use kube::core::ErrorResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Update of {kind} '{name}' still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted {
        kind: &'static str,
        name: String,
        attempts: u32,
    },
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when the object store rejected a write because of a stale resourceVersion.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ErrorResponse { code: 409, .. })))
    }

    /// Whether a later reconcile can be expected to succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ErrorResponse { code, .. })) => {
                *code == 409 || *code == 429 || *code >= 500
            }
            Error::Kube(_) => true,
            Error::ConflictRetriesExhausted { .. } => true,
            Error::Serialization(_) | Error::MissingObjectKey(_) => false,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Serialization(_) => "serialization",
            Error::ConflictRetriesExhausted { .. } => "conflict",
            Error::MissingObjectKey(_) => "missing_key",
        }
    }
}

/// Outcome of a single eviction call that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvictionError {
    /// The API server refused the eviction because it would violate a disruption budget.
    #[error("Eviction of pod '{pod}' blocked by a disruption budget: {message}")]
    DisruptionBudget { pod: String, message: String },
    /// The pod is already gone.
    #[error("Pod '{pod}' no longer exists")]
    NotFound { pod: String },
    #[error("Unable to create eviction for pod '{pod}': {message}")]
    Retriable { pod: String, message: String },
    #[error("Eviction of pod '{pod}' rejected: {message}")]
    Fatal { pod: String, message: String },
}

impl EvictionError {
    pub fn should_retry(&self) -> bool {
        match self {
            Self::DisruptionBudget { .. } | Self::Retriable { .. } => true,
            Self::NotFound { .. } | Self::Fatal { .. } => false,
        }
    }
}
