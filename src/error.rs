//! Error types for layerlens

use layerlens_oci::OciError;
use thiserror::Error;

/// Result type alias using layerlens Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in layerlens operations
#[derive(Error, Debug)]
pub enum Error {
    /// Registry, blob store or layer errors
    #[error(transparent)]
    Oci(#[from] OciError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller is not (or no longer) allowed to access a scope
    #[error("Unauthorized: access to {0} denied")]
    Unauthorized(String),

    /// Path not present in the merged image view
    #[error("Not found: {0}")]
    NotFound(String),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP-style status for surfacing this error at a service boundary:
    /// 404 for missing things, 401 for auth failures, 500 otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Unauthorized(_) => 401,
            Error::Oci(e) if e.is_not_found() => 404,
            Error::Oci(e) if e.is_unauthorized() => 401,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == 401
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::from(OciError::NotFound("x".into())).status_code(), 404);
        assert_eq!(Error::NotFound("bin/sh".into()).status_code(), 404);
        assert_eq!(Error::from(OciError::Unauthorized("x".into())).status_code(), 401);
        assert_eq!(
            Error::from(OciError::ScopeMismatch {
                requested: "repository:a".into(),
                challenged: "repository:b:pull".into(),
            })
            .status_code(),
            401
        );
        assert_eq!(Error::Unauthorized("repository:a".into()).status_code(), 401);
        assert_eq!(Error::from(OciError::Transport("boom".into())).status_code(), 500);
        assert_eq!(Error::Config("bad".into()).status_code(), 500);
    }
}
