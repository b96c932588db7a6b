/// Errors produced by the registry client, blob store and layer tooling.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    /// Repository, tag, digest or path does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// The registry challenge could not be satisfied, or the granted scope
    /// was narrower than the one requested.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A 401 challenge named a different scope than the one derived from
    /// the request path.
    #[error("scope mismatch: requested {requested}, challenged {challenged}")]
    ScopeMismatch {
        requested: String,
        challenged: String,
    },

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// Retry budget exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported digest: {0}")]
    UnsupportedDigest(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid image reference: {0}")]
    Reference(String),

    #[error("layer error: {0}")]
    Layer(String),

    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("lock {0} is no longer held")]
    LockLost(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OciError::NotFound(_))
    }

    /// `true` for authentication and authorization failures.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            OciError::Unauthorized(_) | OciError::ScopeMismatch { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
