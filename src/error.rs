//! Error types for the classification engine
//!
//! Only configuration problems, insufficient data, collaborator failures and
//! I/O are errors. Numerical degeneracies are recovered in-process and
//! reported as [`crate::em::Degeneracy`] events instead.

use thiserror::Error;

/// Errors returned by the classification engine and its adapters
#[derive(Debug, Error)]
pub enum AbcError {
    /// Invalid parameters or mismatched inputs, detected before iterating
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Not enough foreground samples for the requested number of classes
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The registration collaborator failed or returned unusable volumes
    #[error("external collaborator failed: {0}")]
    ExternalCollaborator(String),

    /// Image I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Worker pool could not be created
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl AbcError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AbcError::Configuration(msg.into())
    }

    /// True for failures that are caused by the caller's inputs
    pub fn is_user_facing(&self) -> bool {
        matches!(self, AbcError::Configuration(_) | AbcError::InsufficientData(_))
    }
}

pub type Result<T> = std::result::Result<T, AbcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_classification() {
        assert!(AbcError::config("bad K").is_user_facing());
        assert!(AbcError::InsufficientData("2 voxels".into()).is_user_facing());
        assert!(!AbcError::ExternalCollaborator("warp".into()).is_user_facing());
        assert!(!AbcError::Io("disk".into()).is_user_facing());
    }

    #[test]
    fn test_error_messages() {
        let err = AbcError::config("prior count 1 < 2");
        assert_eq!(err.to_string(), "configuration error: prior count 1 < 2");
    }
}
