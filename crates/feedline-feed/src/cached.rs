//! The value type stored in the feed's query cache.

use feedline_cache::{CacheValue, ResourceHandle};
use serde::{Deserialize, Serialize};

use crate::timeline::TimelineData;
use crate::types::{Channel, CommentThread};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CachedData {
    Channels(Vec<Channel>),
    Timeline(TimelineData),
    Thread(CommentThread),
    /// Session-scoped; only the bytes behind it are persisted, by the media cache.
    #[serde(skip)]
    Media(ResourceHandle),
}

impl CacheValue for CachedData {
    fn is_session_scoped(&self) -> bool {
        matches!(self, CachedData::Media(_))
    }
}

impl CachedData {
    pub fn as_timeline(&self) -> Option<&TimelineData> {
        match self {
            CachedData::Timeline(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_timeline_mut(&mut self) -> Option<&mut TimelineData> {
        match self {
            CachedData::Timeline(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_timeline(self) -> Option<TimelineData> {
        match self {
            CachedData::Timeline(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_thread_mut(&mut self) -> Option<&mut CommentThread> {
        match self {
            CachedData::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_thread(self) -> Option<CommentThread> {
        match self {
            CachedData::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_channels(self) -> Option<Vec<Channel>> {
        match self {
            CachedData::Channels(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_media(&self) -> Option<&ResourceHandle> {
        match self {
            CachedData::Media(h) => Some(h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use feedline_cache::codec;

    use super::*;

    #[test]
    fn test_thread_survives_codec() {
        let value = CachedData::Thread(CommentThread {
            total_count: 2,
            discussion_chat_id: Some(-1_001_234_567_890_123),
            ..CommentThread::default()
        });
        let text = codec::encode(&value).unwrap();
        assert!(text.contains(r#""type":"thread""#));
        assert_eq!(codec::decode::<CachedData>(&text).unwrap(), value);
    }

    #[test]
    fn test_only_media_is_session_scoped() {
        assert!(!CachedData::Channels(vec![]).is_session_scoped());
        assert!(!CachedData::Thread(CommentThread::default()).is_session_scoped());
    }
}
