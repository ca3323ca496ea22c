//! Error taxonomy shared by every core operation.
//!
//! Expected conditions (not-found, in-progress, unavailable services) are
//! typed variants so that callers can match on them and render a message.
//! Adapter failures that carry no domain meaning are wrapped in
//! [`Error::Other`].

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entity with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed or invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Functionality that is declared but not available.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Unknown connector, processor, or content type.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// A sync for this source is already running.
    #[error("sync already in progress for source {0}")]
    SyncInProgress(String),

    #[error("LLM service unavailable")]
    LlmUnavailable,

    #[error("embedding service unavailable")]
    EmbeddingUnavailable,

    #[error("search engine unavailable")]
    SearchUnavailable,

    #[error("vector index unavailable")]
    VectorIndexUnavailable,

    /// The connector requires credentials but none are stored for the source.
    #[error("authentication required for source {0}")]
    AuthRequired(String),

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// The connector stream terminated with an error; the run is aborted.
    #[error("connector error for source {source_id}: {message}")]
    Connector { source_id: String, message: String },

    /// The operation observed a cancellation signal and stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// One or more independent units of a task run failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for the service-unavailable family of errors.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::LlmUnavailable
                | Error::EmbeddingUnavailable
                | Error::SearchUnavailable
                | Error::VectorIndexUnavailable
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("source fs-1").is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }

    #[test]
    fn test_unavailable_family() {
        assert!(Error::LlmUnavailable.is_unavailable());
        assert!(Error::VectorIndexUnavailable.is_unavailable());
        assert!(!Error::SyncInProgress("a".into()).is_unavailable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::Connector {
            source_id: "gh-1".into(),
            message: "401 unauthorized".into(),
        };
        assert_eq!(
            err.to_string(),
            "connector error for source gh-1: 401 unauthorized"
        );
    }
}
