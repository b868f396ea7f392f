//! Property tests for LRU eviction in the media cache.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::runtime::Runtime;

use feedline_cache::{
    MediaCache, MediaIdentity, MediaSource, MemoryStore, QueryError, RetryPolicy, SizeVariant,
};

struct EchoSource;

#[async_trait]
impl MediaSource for EchoSource {
    async fn download(&self, identity: &MediaIdentity) -> Result<Vec<u8>, QueryError> {
        Ok(identity.storage_key().into_bytes())
    }
}

fn identity(message_id: i64) -> MediaIdentity {
    MediaIdentity::Message {
        channel_id: 1,
        message_id,
        size: SizeVariant::Thumb,
    }
}

fn cache(capacity: usize) -> Arc<MediaCache> {
    MediaCache::new(
        capacity,
        Arc::new(MemoryStore::new()),
        Arc::new(EchoSource),
        RetryPolicy::none(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Filling past capacity evicts exactly the identity that was not
    /// re-read, whatever the order of the other reads.
    #[test]
    fn untouched_identity_is_evicted_first(
        capacity in 1usize..12,
        touches in prop::collection::vec(1usize..12, 0..20),
    ) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let cache = cache(capacity);
            for id in 0..capacity as i64 {
                cache.try_resolve(&identity(id)).await.unwrap();
            }
            for t in touches {
                let id = (t % capacity) as i64;
                if id != 0 {
                    cache.try_resolve(&identity(id)).await.unwrap();
                }
            }
            cache.try_resolve(&identity(capacity as i64)).await.unwrap();
            assert!(!cache.contains(&identity(0)));
            for id in 1..=capacity as i64 {
                assert!(cache.contains(&identity(id)));
            }
            assert_eq!(cache.len(), capacity);
        });
    }

    /// The cache never holds more than its capacity and always keeps the
    /// most recent resolve.
    #[test]
    fn never_exceeds_capacity(
        capacity in 1usize..8,
        ids in prop::collection::vec(0i64..16, 1..48),
    ) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let cache = cache(capacity);
            for id in &ids {
                cache.try_resolve(&identity(*id)).await.unwrap();
                assert!(cache.len() <= capacity);
                assert!(cache.contains(&identity(*id)));
            }
            let distinct: HashSet<i64> = ids.iter().copied().collect();
            assert_eq!(cache.len(), distinct.len().min(capacity));
        });
    }

    /// Eviction revokes the handle of the evicted identity.
    #[test]
    fn media_cache_evicts_first_identity(capacity in 1usize..12) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let cache = cache(capacity);
            let first = cache.try_resolve(&identity(0)).await.unwrap();
            for id in 1..=capacity as i64 {
                cache.try_resolve(&identity(id)).await.unwrap();
            }
            assert!(!cache.contains(&identity(0)));
            assert!(!cache.registry().is_live(&first));
            for id in 1..=capacity as i64 {
                assert!(cache.contains(&identity(id)));
            }
        });
    }
}
