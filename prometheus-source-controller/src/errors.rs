/// Extension methods for Kubernetes API errors.
pub trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_invalid(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_invalid(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 400 || e.code == 422 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// The object's spec can never be reconciled as-is, e.g. a required field is
    /// missing. Reconciliation resumes once the object is changed.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    /// A referenced object (e.g. the sink) is missing or not yet addressable.
    /// This is expected to be temporary, the referencing object is re-enqueued
    /// as soon as the referenced object changes.
    #[error("{0}")]
    SinkNotResolved(String),
    /// Invalid controller configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether the failed reconciliation should be retried with backoff.
    pub fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidSpec(_) => false,
            ControllerError::Configuration(_) => false,
            ControllerError::Serde(_) => false,
            // Stale resourceVersion, the retry starts from the latest object.
            ControllerError::KubeApi(e) if e.is_conflict() => true,
            ControllerError::KubeApi(e) => !e.is_invalid(),
            _ => true,
        }
    }
}
