//! Error types for feed operations.

use feedline_cache::{CacheError, QueryError, StoreError};
use thiserror::Error;

use crate::types::{ChannelId, MessageId};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeline is not loaded")]
    TimelineNotLoaded,

    #[error("comment thread {channel_id}/{message_id} is not loaded")]
    ThreadNotLoaded {
        channel_id: ChannelId,
        message_id: MessageId,
    },

    #[error("comment {0} not found")]
    CommentNotFound(MessageId),
}

impl FeedError {
    /// The query-level error, if this wraps one.
    pub fn as_query(&self) -> Option<&QueryError> {
        match self {
            FeedError::Query(e) => Some(e),
            _ => None,
        }
    }
}
