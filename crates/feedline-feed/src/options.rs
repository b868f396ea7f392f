//! Per-query-type options and engine configuration.

use std::time::Duration;

use feedline_cache::config::millis;
use feedline_cache::{CacheConfig, QueryKey, QueryOptions, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::keys;

/// Option presets for each feed query type.
pub trait QueryPresets: Sized {
    fn timeline() -> Self;
    fn comments() -> Self;
    fn channels() -> Self;
    fn media() -> Self;

    /// The preset matching the key's domain.
    fn for_key(key: &QueryKey) -> Self;
}

impl QueryPresets for QueryOptions {
    fn timeline() -> Self {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(30))
            .with_gc_time(Duration::from_secs(10 * 60))
    }

    fn comments() -> Self {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(30))
            .with_gc_time(Duration::from_secs(5 * 60))
    }

    fn channels() -> Self {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(5 * 60))
            .with_gc_time(Duration::from_secs(30 * 60))
    }

    /// Media never goes stale and handles are never snapshotted.
    fn media() -> Self {
        QueryOptions::default()
            .with_stale_time(Duration::MAX)
            .with_gc_time(Duration::from_secs(10 * 60))
            .with_persist(false)
            .with_retry(RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::default()
            })
    }

    fn for_key(key: &QueryKey) -> Self {
        match key.domain() {
            Some(keys::TIMELINE) => Self::timeline(),
            Some(keys::COMMENTS) => Self::comments(),
            Some(keys::CHANNELS) => Self::channels(),
            Some(keys::MEDIA) => Self::media(),
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Messages requested per channel per page.
    pub page_size: usize,
    /// Album backfills issued concurrently.
    pub backfill_batch_size: usize,
    /// Pause between backfill batches.
    #[serde(with = "millis")]
    pub backfill_batch_delay: Duration,
    /// Retries for one channel's page before it is marked failed.
    pub retry: RetryPolicy,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            backfill_batch_size: 4,
            backfill_batch_delay: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentConfig {
    pub page_size: usize,
    /// Replies shown before a "more replies" row.
    pub visible_replies: usize,
    /// Deepest nesting rendered inline; deeper subtrees get a continue marker.
    pub max_depth: usize,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            visible_replies: 3,
            max_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Upper bound on dialogs iterated when listing channels.
    pub max_dialogs: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { max_dialogs: 200 }
    }
}

/// Everything [`FeedContext`](crate::FeedContext) needs to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub cache: CacheConfig,
    pub timeline: TimelineConfig,
    pub comments: CommentConfig,
    pub directory: DirectoryConfig,
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(keys::timeline(2), QueryOptions::timeline() ; "timeline")]
    #[test_case(keys::comments_thread(1, 2), QueryOptions::comments() ; "comments")]
    #[test_case(keys::channels(), QueryOptions::channels() ; "channels")]
    #[test_case(QueryKey::new("media").with("download"), QueryOptions::media() ; "media")]
    #[test_case(QueryKey::new("other"), QueryOptions::default() ; "fallback")]
    fn test_presets_by_domain(key: QueryKey, expected: QueryOptions) {
        assert_eq!(QueryOptions::for_key(&key), expected);
    }

    #[test]
    fn test_media_is_not_persisted() {
        assert!(!QueryOptions::media().persist);
        assert!(QueryOptions::timeline().persist);
    }

    #[test]
    fn test_feed_config_from_partial_json() {
        let config: FeedConfig =
            serde_json::from_str(r#"{"timeline":{"page_size":5},"cache":{"media_capacity":3}}"#)
                .unwrap();
        assert_eq!(config.timeline.page_size, 5);
        assert_eq!(config.timeline.backfill_batch_size, 4);
        assert_eq!(config.cache.media_capacity, 3);
        assert_eq!(config.comments.visible_replies, 3);
    }
}
