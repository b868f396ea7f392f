//! Snapshot persistence for the query cache.
//!
//! The whole cache is written as a single document under a fixed key with a
//! separate version marker next to it. A marker that does not match the
//! configured cache version drops the snapshot outright; there is no
//! migration path.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::codec;
use crate::config::{CacheConfig, QueryOptions};
use crate::error::CacheError;
use crate::key::QueryKey;
use crate::query::{CacheValue, QueryCache};
use crate::store::KvStore;

/// The persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSnapshot<V> {
    #[serde(with = "codec::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub client_state: ClientState<V>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientState<V> {
    pub queries: Vec<PersistedQuery<V>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQuery<V> {
    pub key: QueryKey,
    pub data: V,
    #[serde(with = "codec::timestamp")]
    pub fetched_at: DateTime<Utc>,
}

/// What [`Persister::restore`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Entries were loaded into the cache as stale.
    Hydrated { entries: usize },
    /// The stored marker was missing or different. The snapshot was dropped
    /// and persisted media bytes should be purged too.
    VersionMismatch { found: Option<String> },
    /// The snapshot was older than the retention horizon and was dropped.
    Expired,
    /// Nothing was stored.
    Empty,
    /// The snapshot could not be decoded and was dropped.
    Corrupt,
}

type OptionsFor = Arc<dyn Fn(&QueryKey) -> QueryOptions + Send + Sync>;

/// Reads and writes cache snapshots.
pub struct Persister<V> {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    options_for: OptionsFor,
    _value: PhantomData<fn() -> V>,
}

impl<V> Persister<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            options_for: Arc::new(|_| QueryOptions::default()),
            _value: PhantomData,
        }
    }

    /// Options applied to restored entries, chosen per key.
    pub fn with_options(mut self, f: impl Fn(&QueryKey) -> QueryOptions + Send + Sync + 'static) -> Self {
        self.options_for = Arc::new(f);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Load the stored snapshot into `cache`.
    #[tracing::instrument(skip(self, cache), fields(version = %self.config.cache_version))]
    pub async fn restore(&self, cache: &QueryCache<V>) -> Result<RestoreOutcome, CacheError> {
        let version_key = self.config.version_key();
        let current = self.config.cache_version.as_bytes();

        let stored = self.store.get(&version_key).await?;
        if stored.as_deref() != Some(current) {
            let found = stored.map(|v| String::from_utf8_lossy(&v).into_owned());
            info!(found = ?found, "cache version changed, dropping snapshot");
            self.store.delete(&self.config.snapshot_key).await?;
            self.store.set(&version_key, current.to_vec()).await?;
            return Ok(RestoreOutcome::VersionMismatch { found });
        }

        let snapshot = match self.read().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(RestoreOutcome::Empty),
            Err(CacheError::Store(e)) => return Err(CacheError::Store(e)),
            Err(e) => {
                warn!(error = %e, "snapshot is unreadable, dropping it");
                self.delete().await?;
                return Ok(RestoreOutcome::Corrupt);
            }
        };

        let age = (self.clock.now() - snapshot.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > self.config.snapshot_max_age {
            info!(age_secs = age.as_secs(), "snapshot expired, dropping it");
            self.delete().await?;
            return Ok(RestoreOutcome::Expired);
        }

        let entries = snapshot.client_state.queries.len();
        for query in snapshot.client_state.queries {
            let options = (self.options_for)(&query.key);
            cache.hydrate(query.key, query.data, query.fetched_at, options);
        }
        info!(entries, "restored query cache snapshot");
        Ok(RestoreOutcome::Hydrated { entries })
    }

    /// Write every persistable entry. Returns how many were written.
    ///
    /// Entries that only left memory through garbage collection are carried
    /// over from the previous snapshot until they outlive `snapshot_max_age`.
    /// Removed or cleared entries are dropped.
    pub async fn checkpoint(&self, cache: &QueryCache<V>) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let discarded = cache.take_discarded();
        let mut queries: Vec<PersistedQuery<V>> = cache
            .persistable_entries()
            .into_iter()
            .map(|e| PersistedQuery {
                key: e.key,
                data: e.value,
                fetched_at: e.fetched_at,
            })
            .collect();

        let previous = match self.read().await {
            Ok(previous) => previous,
            Err(CacheError::Store(e)) => return Err(CacheError::Store(e)),
            Err(e) => {
                warn!(error = %e, "previous snapshot is unreadable, not carrying it over");
                None
            }
        };
        if let Some(previous) = previous {
            let in_memory: HashSet<QueryKey> = queries.iter().map(|q| q.key.clone()).collect();
            let carried: Vec<PersistedQuery<V>> = previous
                .client_state
                .queries
                .into_iter()
                .filter(|q| !in_memory.contains(&q.key) && !discarded.contains(&q.key))
                .filter(|q| {
                    let age = (now - q.fetched_at).to_std().unwrap_or(Duration::ZERO);
                    age <= self.config.snapshot_max_age
                })
                .collect();
            if !carried.is_empty() {
                trace!(carried = carried.len(), "keeping collected entries in snapshot");
            }
            queries.extend(carried);
            queries.sort_by(|a, b| a.key.cmp(&b.key));
        }

        let count = queries.len();
        let snapshot = PersistedSnapshot {
            timestamp: now,
            client_state: ClientState { queries },
        };
        let text = codec::encode(&snapshot)?;
        self.store
            .set(&self.config.snapshot_key, text.into_bytes())
            .await?;
        debug!(entries = count, "checkpointed query cache");
        Ok(count)
    }

    /// Read the stored snapshot without touching any cache.
    pub async fn read(&self) -> Result<Option<PersistedSnapshot<V>>, CacheError> {
        let Some(bytes) = self.store.get(&self.config.snapshot_key).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).map_err(|_| CacheError::NotUtf8)?;
        Ok(Some(codec::decode(&text)?))
    }

    /// Delete the snapshot document.
    pub async fn delete(&self) -> Result<(), CacheError> {
        self.store.delete(&self.config.snapshot_key).await?;
        Ok(())
    }

    /// Delete the snapshot document and the version marker.
    pub async fn reset(&self) -> Result<(), CacheError> {
        self.delete().await?;
        self.store.delete(&self.config.version_key()).await?;
        Ok(())
    }
}

/// Flush the cache to the store whenever it changed, at most once per
/// `interval`, plus once more on shutdown.
pub fn spawn_checkpointer<V>(
    cache: Arc<QueryCache<V>>,
    persister: Arc<Persister<V>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    let mut events = cache.events();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut dirty = false;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while events.try_recv().is_ok() {
                            dirty = true;
                        }
                        if dirty {
                            if let Err(e) = persister.checkpoint(&cache).await {
                                warn!(error = %e, "final checkpoint failed");
                            }
                        }
                        debug!("checkpoint task shutting down");
                        return;
                    }
                }
                event = events.recv() => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => dirty = true,
                    Err(RecvError::Closed) => return,
                },
                _ = ticker.tick() => {
                    if dirty {
                        match persister.checkpoint(&cache).await {
                            Ok(_) => dirty = false,
                            Err(e) => warn!(error = %e, "checkpoint failed"),
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::query_key;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Page {
        ids: Vec<i64>,
    }

    impl CacheValue for Page {}

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())),
            }
        }

        fn persister(&self, version: &str) -> Persister<Page> {
            let config = CacheConfig {
                cache_version: version.to_string(),
                ..CacheConfig::default()
            };
            Persister::new(self.store.clone(), config, self.clock.clone())
        }

        fn cache(&self) -> Arc<QueryCache<Page>> {
            QueryCache::with_clock(self.clock.clone())
        }
    }

    #[tokio::test]
    async fn test_first_start_writes_marker() {
        let fx = Fixture::new();
        let outcome = fx.persister("1").restore(&fx.cache()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::VersionMismatch { found: None });

        let outcome = fx.persister("1").restore(&fx.cache()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Empty);
    }

    #[tokio::test]
    async fn test_checkpoint_then_restore_hydrates_stale() {
        let fx = Fixture::new();
        let persister = fx.persister("1");
        persister.restore(&fx.cache()).await.unwrap();

        let cache = fx.cache();
        let key = query_key!["timeline", 2_i64];
        cache.set_data(&key, Page { ids: vec![3, 2, 1] }).await;
        assert_eq!(persister.checkpoint(&cache).await.unwrap(), 1);

        let fresh = fx.cache();
        let outcome = persister.restore(&fresh).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Hydrated { entries: 1 });
        let state = fresh.state(&key);
        assert_eq!(state.data, Some(Page { ids: vec![3, 2, 1] }));
        assert_eq!(state.status, crate::query::EntryStatus::Stale);
    }

    #[tokio::test]
    async fn test_version_bump_drops_snapshot() {
        let fx = Fixture::new();
        let v1 = fx.persister("1");
        v1.restore(&fx.cache()).await.unwrap();
        let cache = fx.cache();
        cache.set_data(&query_key!["a"], Page { ids: vec![1] }).await;
        v1.checkpoint(&cache).await.unwrap();

        let v2 = fx.persister("2");
        let fresh = fx.cache();
        let outcome = v2.restore(&fresh).await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::VersionMismatch {
                found: Some("1".to_string())
            }
        );
        assert!(fresh.is_empty());
        assert!(v2.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_dropped() {
        let fx = Fixture::new();
        let persister = fx.persister("1");
        persister.restore(&fx.cache()).await.unwrap();
        let cache = fx.cache();
        cache.set_data(&query_key!["a"], Page { ids: vec![1] }).await;
        persister.checkpoint(&cache).await.unwrap();

        fx.clock.advance(chrono::Duration::days(8));
        let outcome = persister.restore(&fx.cache()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Expired);
        assert!(persister.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_dropped() {
        let fx = Fixture::new();
        let persister = fx.persister("1");
        persister.restore(&fx.cache()).await.unwrap();
        fx.store
            .set(&persister.config().snapshot_key, b"{not json".to_vec())
            .await
            .unwrap();

        let outcome = persister.restore(&fx.cache()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Corrupt);
        assert!(fx.store.get(&persister.config().snapshot_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collected_entry_outlives_gc_in_snapshot() {
        let fx = Fixture::new();
        let persister = fx.persister("1");
        persister.restore(&fx.cache()).await.unwrap();
        let cache = fx.cache();
        cache.set_data(&query_key!["a"], Page { ids: vec![1] }).await;
        persister.checkpoint(&cache).await.unwrap();

        fx.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(cache.gc(), 1);
        cache.set_data(&query_key!["b"], Page { ids: vec![2] }).await;
        assert_eq!(persister.checkpoint(&cache).await.unwrap(), 2);

        let snapshot = persister.read().await.unwrap().unwrap();
        let keys: Vec<String> = snapshot
            .client_state
            .queries
            .iter()
            .map(|q| q.key.to_string())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);

        // Past the snapshot horizon the collected entry is finally dropped.
        fx.clock.advance(chrono::Duration::days(8));
        cache.set_data(&query_key!["b"], Page { ids: vec![3] }).await;
        assert_eq!(persister.checkpoint(&cache).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_and_cleared_entries_leave_snapshot() {
        let fx = Fixture::new();
        let persister = fx.persister("1");
        persister.restore(&fx.cache()).await.unwrap();
        let cache = fx.cache();
        cache.set_data(&query_key!["a"], Page { ids: vec![1] }).await;
        cache.set_data(&query_key!["b"], Page { ids: vec![2] }).await;
        persister.checkpoint(&cache).await.unwrap();

        assert!(cache.remove(&query_key!["a"]));
        assert_eq!(persister.checkpoint(&cache).await.unwrap(), 1);

        cache.clear();
        assert_eq!(persister.checkpoint(&cache).await.unwrap(), 0);
        let snapshot = persister.read().await.unwrap().unwrap();
        assert!(snapshot.client_state.queries.is_empty());
    }

    #[tokio::test]
    async fn test_checkpointer_flushes_on_shutdown() {
        let fx = Fixture::new();
        let persister = Arc::new(fx.persister("1"));
        let cache = fx.cache();
        let (tx, rx) = watch::channel(false);
        let task = spawn_checkpointer(cache.clone(), persister.clone(), Duration::from_secs(3600), rx);

        tokio::task::yield_now().await;
        cache.set_data(&query_key!["a"], Page { ids: vec![9] }).await;
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let snapshot = persister.read().await.unwrap().unwrap();
        assert_eq!(snapshot.client_state.queries.len(), 1);
        assert_eq!(snapshot.client_state.queries[0].data, Page { ids: vec![9] });
    }
}
