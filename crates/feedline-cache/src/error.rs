//! Error types for the cache layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    Disabled,
    NotFound,
    Unknown,
}

/// Errors produced by query fetchers, media downloads and mutations.
///
/// Cloneable so a single in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum QueryError {
    /// Transient transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The caller supplied an invalid request (e.g. empty comment text).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The feature is unavailable for this target (e.g. comments disabled).
    #[error("disabled: {0}")]
    Disabled(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything the remote collaborator could not classify.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl QueryError {
    /// The taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Network(m)
            | Self::Validation(m)
            | Self::Disabled(m)
            | Self::NotFound(m)
            | Self::Unknown(m) => m,
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unknown(_))
    }

    /// How many retries this error allows under a policy of `configured` retries.
    ///
    /// Unknown errors are retried conservatively (at most once).
    pub fn retry_limit(&self, configured: u32) -> u32 {
        match self {
            Self::Network(_) => configured,
            Self::Unknown(_) => configured.min(1),
            Self::Validation(_) | Self::Disabled(_) | Self::NotFound(_) => 0,
        }
    }
}

/// Errors from the persistent key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Errors from the snapshot codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed {tag} tag: {reason}")]
    InvalidTag { tag: &'static str, reason: String },
}

/// Errors from snapshot restore and checkpointing.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("snapshot is not valid UTF-8")]
    NotUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(QueryError::Network("reset".into()), true, 3 ; "network uses full policy")]
    #[test_case(QueryError::Unknown("?".into()), true, 1 ; "unknown retried once")]
    #[test_case(QueryError::Validation("empty".into()), false, 0 ; "validation never retried")]
    #[test_case(QueryError::Disabled("comments".into()), false, 0 ; "disabled never retried")]
    #[test_case(QueryError::NotFound("post".into()), false, 0 ; "not found never retried")]
    fn test_retry_classification(error: QueryError, retryable: bool, limit: u32) {
        assert_eq!(error.is_retryable(), retryable);
        assert_eq!(error.retry_limit(3), limit);
    }

    #[test]
    fn test_unknown_limit_respects_zero_policy() {
        assert_eq!(QueryError::Unknown("x".into()).retry_limit(0), 0);
    }

    #[test]
    fn test_kind_and_message() {
        let err = QueryError::Disabled("comments are off".into());
        assert_eq!(err.kind(), ErrorKind::Disabled);
        assert_eq!(err.message(), "comments are off");
        assert_eq!(err.to_string(), "disabled: comments are off");
    }

    #[test]
    fn test_query_error_serializes_with_kind() {
        let json = serde_json::to_string(&QueryError::NotFound("post 5".into())).unwrap();
        assert_eq!(json, r#"{"kind":"not_found","message":"post 5"}"#);
    }
}
