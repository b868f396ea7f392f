//! Cache configuration.
//!
//! All durations are serialized as integer milliseconds so the config can be
//! read from a plain JSON file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Per-query-type behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// How long a successful result is served without refetching.
    #[serde(with = "millis")]
    pub stale_time: Duration,
    /// How long an unobserved entry stays in memory.
    #[serde(with = "millis")]
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    /// Disabled queries serve cached data but never fetch.
    pub enabled: bool,
    /// Whether the entry is written into the snapshot.
    pub persist: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            enabled: true,
            persist: true,
        }
    }
}

impl QueryOptions {
    pub fn with_stale_time(self, stale_time: Duration) -> Self {
        Self { stale_time, ..self }
    }

    pub fn with_gc_time(self, gc_time: Duration) -> Self {
        Self { gc_time, ..self }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    pub fn with_persist(self, persist: bool) -> Self {
        Self { persist, ..self }
    }
}

/// Process-wide cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Compared against the stored marker on startup; a mismatch drops the snapshot.
    pub cache_version: String,
    /// Storage key of the snapshot document.
    pub snapshot_key: String,
    /// Snapshots older than this are discarded on restore.
    #[serde(with = "millis")]
    pub snapshot_max_age: Duration,
    /// How often dirty cache state is flushed to the store.
    #[serde(with = "millis")]
    pub checkpoint_interval: Duration,
    #[serde(with = "millis")]
    pub gc_interval: Duration,
    /// Maximum number of media handles kept in memory.
    pub media_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_version: "1".to_string(),
            snapshot_key: "feedline:query-cache".to_string(),
            snapshot_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            checkpoint_interval: Duration::from_secs(1),
            gc_interval: Duration::from_secs(60),
            media_capacity: 200,
        }
    }
}

impl CacheConfig {
    /// Storage key of the cache-version marker.
    pub fn version_key(&self) -> String {
        format!("{}:version", self.snapshot_key)
    }
}

/// Serde adapter for `Duration` as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"cache_version":"7","media_capacity":10}"#).unwrap();
        assert_eq!(config.cache_version, "7");
        assert_eq!(config.media_capacity, 10);
        assert_eq!(config.snapshot_key, CacheConfig::default().snapshot_key);
        assert_eq!(config.version_key(), "feedline:query-cache:version");
    }

    #[test]
    fn test_query_options_durations_in_millis() {
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(2));
        let json = serde_json::to_value(options).unwrap();
        assert_eq!(json["stale_time"], 2000);
        assert_eq!(json["retry"]["max_retries"], 3);
    }
}
