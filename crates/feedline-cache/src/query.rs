//! Generic async-result cache with stale-while-revalidate, request
//! deduplication, garbage collection and optimistic mutations.
//!
//! Every write to an entry takes a fresh value from a cache-wide generation
//! counter. A fetch remembers the generation it started from and its result
//! is discarded when the entry has moved on by the time it resolves (or when
//! a mutation is in progress on the key).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueryOptions;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::retry::{RetryOutcome, RetryPolicy, retry_with_backoff};

/// Capacity of the update broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Values that can live in a [`QueryCache`].
pub trait CacheValue: Clone + Send + Sync + 'static {
    /// Values backed by session-only resources are never written to the snapshot.
    fn is_session_scoped(&self) -> bool {
        false
    }
}

pub type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<V, QueryError>> + Send>>;

/// Produces a fresh fetch each time it is called.
pub type Fetcher<V> = Arc<dyn Fn() -> FetchFuture<V> + Send + Sync>;

type SharedFetch<V> = Shared<FetchFuture<V>>;

/// Wrap an async closure as a [`Fetcher`].
pub fn fetcher_fn<V, F, Fut>(f: F) -> Fetcher<V>
where
    V: CacheValue,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as FetchFuture<V>)
}

/// Observable status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Never fetched successfully and no error yet.
    Pending,
    Fresh,
    Stale,
    /// The last fetch failed. Previously fetched data, if any, is still served.
    Error,
}

/// A read-only view of one entry.
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    pub data: Option<V>,
    pub status: EntryStatus,
    pub error: Option<QueryError>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub is_fetching: bool,
}

impl<V> QueryState<V> {
    fn missing() -> Self {
        Self {
            data: None,
            status: EntryStatus::Pending,
            error: None,
            fetched_at: None,
            retry_count: 0,
            is_fetching: false,
        }
    }
}

/// Change notification for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Updated { key: QueryKey },
    /// Explicitly removed.
    Removed { key: QueryKey },
    /// Dropped from memory by garbage collection.
    Collected { key: QueryKey },
    Cleared,
}

/// Entries explicitly dropped since the last [`QueryCache::take_discarded`].
///
/// Garbage-collected entries are not listed: they only left memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discarded {
    pub keys: HashSet<QueryKey>,
    /// The whole cache was cleared.
    pub all: bool,
}

impl Discarded {
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.all || self.keys.contains(key)
    }
}

struct CacheEntry<V> {
    value: Option<V>,
    error: Option<QueryError>,
    fetched_at: Option<DateTime<Utc>>,
    retry_count: u32,
    invalidated: bool,
    generation: u64,
    subscribers: usize,
    last_touched: DateTime<Utc>,
    options: QueryOptions,
    fetcher: Option<Fetcher<V>>,
    mutating: u32,
}

impl<V: CacheValue> CacheEntry<V> {
    fn new(options: QueryOptions, now: DateTime<Utc>, generation: u64) -> Self {
        Self {
            value: None,
            error: None,
            fetched_at: None,
            retry_count: 0,
            invalidated: false,
            generation,
            subscribers: 0,
            last_touched: now,
            options,
            fetcher: None,
            mutating: 0,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let Some(fetched_at) = self.fetched_at else {
            return false;
        };
        if self.invalidated || self.value.is_none() {
            return false;
        }
        let age = (now - fetched_at).to_std().unwrap_or(Duration::ZERO);
        age < self.options.stale_time
    }

    fn status(&self, now: DateTime<Utc>) -> EntryStatus {
        if self.error.is_some() {
            EntryStatus::Error
        } else if self.value.is_none() {
            EntryStatus::Pending
        } else if self.is_fresh(now) {
            EntryStatus::Fresh
        } else {
            EntryStatus::Stale
        }
    }

    fn can_fetch(&self) -> bool {
        self.fetcher.is_some() && self.options.enabled
    }
}

/// The observable part of an entry, captured before an optimistic update.
struct EntrySnapshot<V> {
    key: QueryKey,
    value: Option<V>,
    error: Option<QueryError>,
    fetched_at: Option<DateTime<Utc>>,
    retry_count: u32,
    invalidated: bool,
}

/// An entry eligible for the persisted snapshot.
#[derive(Debug, Clone)]
pub struct PersistableEntry<V> {
    pub key: QueryKey,
    pub value: V,
    pub fetched_at: DateTime<Utc>,
}

/// A write with a speculative local effect.
///
/// `apply` runs against every cached key before `execute`; if `execute`
/// fails the entries are restored from a snapshot taken just before.
#[async_trait]
pub trait Mutation<V: CacheValue>: Send + Sync {
    type Output: Send;

    /// Keys touched by the speculative update.
    fn keys(&self) -> Vec<QueryKey>;

    /// Apply the speculative change to one cached value.
    fn apply(&self, key: &QueryKey, value: &mut V);

    /// Perform the remote write.
    async fn execute(&self) -> Result<Self::Output, QueryError>;

    /// Fold the confirmed result into a cached value.
    fn confirm(&self, _key: &QueryKey, _value: &mut V, _output: &Self::Output) {}
}

/// Process-wide query cache.
pub struct QueryCache<V: CacheValue> {
    entries: DashMap<QueryKey, CacheEntry<V>>,
    inflight: DashMap<QueryKey, (u64, SharedFetch<V>)>,
    write_locks: DashMap<QueryKey, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    events: broadcast::Sender<QueryEvent>,
    discarded: StdMutex<Discarded>,
}

impl<V: CacheValue> QueryCache<V> {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            write_locks: DashMap::new(),
            clock,
            generation: AtomicU64::new(0),
            events,
            discarded: StdMutex::new(Discarded::default()),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event: QueryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Subscribe to entry changes.
    pub fn events(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_data(&self, key: &QueryKey) -> Option<V> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    pub fn state(&self, key: &QueryKey) -> QueryState<V> {
        let now = self.clock.now();
        let is_fetching = self.inflight.contains_key(key);
        match self.entries.get(key) {
            Some(entry) => QueryState {
                data: entry.value.clone(),
                status: entry.status(now),
                error: entry.error.clone(),
                fetched_at: entry.fetched_at,
                retry_count: entry.retry_count,
                is_fetching,
            },
            None => QueryState::missing(),
        }
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    fn register(&self, key: &QueryKey, fetcher: Fetcher<V>, options: QueryOptions) {
        let now = self.clock.now();
        let generation = self.next_generation();
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(options, now, generation));
        entry.fetcher = Some(fetcher);
        entry.options = options;
    }

    /// Serve `key` with stale-while-revalidate semantics.
    ///
    /// Fresh data is returned as is. Stale data is returned immediately and a
    /// background refetch is started. Without data the fetch is awaited.
    pub async fn query(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: Fetcher<V>,
        options: QueryOptions,
    ) -> QueryState<V> {
        self.register(key, fetcher, options);
        if !options.enabled {
            return self.state(key);
        }

        let now = self.clock.now();
        let (has_data, fresh) = match self.entries.get(key) {
            Some(entry) => (entry.value.is_some(), entry.is_fresh(now)),
            None => (false, false),
        };

        if fresh {
            trace!(key = %key, "serving fresh entry");
        } else if has_data {
            trace!(key = %key, "serving stale entry, revalidating");
            self.refetch_in_background(key);
        } else if let Some(fetch) = self.start_fetch(key) {
            let _ = fetch.await;
        }
        self.state(key)
    }

    /// Fetch `key` now regardless of freshness, sharing any in-flight fetch.
    pub async fn fetch_query(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: Fetcher<V>,
        options: QueryOptions,
    ) -> Result<V, QueryError> {
        self.register(key, fetcher, options);
        match self.refetch(key).await {
            Some(result) => result,
            None => self
                .get_data(key)
                .ok_or_else(|| QueryError::Disabled(format!("query {key} is disabled"))),
        }
    }

    /// Refetch using the registered fetcher. `None` when there is no fetcher
    /// or the query is disabled.
    pub async fn refetch(self: &Arc<Self>, key: &QueryKey) -> Option<Result<V, QueryError>> {
        let fetch = self.start_fetch(key)?;
        Some(fetch.await)
    }

    fn refetch_in_background(self: &Arc<Self>, key: &QueryKey) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "no runtime, skipping background refetch");
            return;
        };
        if let Some(fetch) = self.start_fetch(key) {
            handle.spawn(async move {
                let _ = fetch.await;
            });
        }
    }

    fn start_fetch(self: &Arc<Self>, key: &QueryKey) -> Option<SharedFetch<V>> {
        let (fetcher, options, generation) = {
            let entry = self.entries.get(key)?;
            if !entry.can_fetch() {
                return None;
            }
            (entry.fetcher.clone()?, entry.options, entry.generation)
        };

        match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().0 == generation {
                    trace!(key = %key, "joining in-flight fetch");
                    return Some(slot.get().1.clone());
                }
                let fetch = self.build_fetch(key, fetcher, options, generation);
                slot.insert((generation, fetch.clone()));
                Some(fetch)
            }
            Entry::Vacant(slot) => {
                let fetch = self.build_fetch(key, fetcher, options, generation);
                slot.insert((generation, fetch.clone()));
                Some(fetch)
            }
        }
    }

    fn build_fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: Fetcher<V>,
        options: QueryOptions,
        generation: u64,
    ) -> SharedFetch<V> {
        let cache = Arc::downgrade(self);
        let key = key.clone();
        let fut: FetchFuture<V> = Box::pin(async move {
            let label = key.to_string();
            let outcome = retry_with_backoff(options.retry, &label, || fetcher()).await;
            if let Some(cache) = cache.upgrade() {
                cache.settle(&key, generation, &outcome);
                cache.inflight.remove_if(&key, |_, (g, _)| *g == generation);
            }
            outcome.result
        });
        fut.shared()
    }

    fn settle(&self, key: &QueryKey, generation: u64, outcome: &RetryOutcome<V>) {
        let now = self.clock.now();
        {
            let Some(mut entry) = self.entries.get_mut(key) else {
                debug!(key = %key, "entry removed during fetch, discarding result");
                return;
            };
            if entry.generation != generation || entry.mutating > 0 {
                debug!(
                    key = %key,
                    started = generation,
                    current = entry.generation,
                    "fetch superseded, discarding result"
                );
                return;
            }
            match &outcome.result {
                Ok(value) => {
                    entry.value = Some(value.clone());
                    entry.error = None;
                    entry.fetched_at = Some(now);
                    entry.invalidated = false;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, retries = outcome.retries, "fetch failed");
                    entry.error = Some(err.clone());
                }
            }
            entry.retry_count = outcome.retries;
            entry.last_touched = now;
            entry.generation = self.next_generation();
        }
        self.notify(QueryEvent::Updated { key: key.clone() });
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn write_lock(&self, key: &QueryKey) -> Arc<Mutex<()>> {
        self.write_locks.entry(key.clone()).or_default().clone()
    }

    async fn lock_key(&self, key: &QueryKey) -> OwnedMutexGuard<()> {
        self.write_lock(key).lock_owned().await
    }

    /// Replace the data for `key` as if it had just been fetched.
    pub async fn set_data(&self, key: &QueryKey, value: V) {
        let _guard = self.lock_key(key).await;
        let now = self.clock.now();
        {
            let generation = self.next_generation();
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(QueryOptions::default(), now, generation));
            entry.value = Some(value);
            entry.error = None;
            entry.fetched_at = Some(now);
            entry.invalidated = false;
            entry.last_touched = now;
            entry.generation = generation;
        }
        self.notify(QueryEvent::Updated { key: key.clone() });
    }

    /// Modify the cached value in place. Returns `None` when nothing is cached.
    ///
    /// Serialized with other writers of the same key, including mutations.
    pub async fn update<R, F>(&self, key: &QueryKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R + Send,
        R: Send,
    {
        let _guard = self.lock_key(key).await;
        let result = {
            let mut entry = self.entries.get_mut(key)?;
            let value = entry.value.as_mut()?;
            let result = f(value);
            entry.last_touched = self.clock.now();
            entry.generation = self.next_generation();
            result
        };
        self.notify(QueryEvent::Updated { key: key.clone() });
        Some(result)
    }

    /// Mark every entry under `prefix` stale and refetch the observed ones.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate(self: &Arc<Self>, prefix: &QueryKey) -> usize {
        let mut touched = Vec::new();
        let mut observed = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.key().starts_with(prefix) {
                continue;
            }
            entry.invalidated = true;
            entry.generation = self.next_generation();
            touched.push(entry.key().clone());
            if entry.subscribers > 0 && entry.can_fetch() {
                observed.push(entry.key().clone());
            }
        }

        debug!(
            prefix = %prefix,
            invalidated = touched.len(),
            refetching = observed.len(),
            "invalidated entries"
        );
        for key in &touched {
            self.notify(QueryEvent::Updated { key: key.clone() });
        }
        for key in &observed {
            self.refetch_in_background(key);
        }
        touched.len()
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.inflight.remove(key);
        self.write_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        if removed {
            self.lock_discarded().keys.insert(key.clone());
            self.notify(QueryEvent::Removed { key: key.clone() });
        }
        removed
    }

    /// Drop every entry. In-flight fetches complete but their results are discarded.
    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        self.inflight.clear();
        self.write_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        *self.lock_discarded() = Discarded {
            keys: HashSet::new(),
            all: true,
        };
        debug!(count, "cleared query cache");
        self.notify(QueryEvent::Cleared);
    }

    fn lock_discarded(&self) -> std::sync::MutexGuard<'_, Discarded> {
        self.discarded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys removed or cleared since the last call.
    pub fn take_discarded(&self) -> Discarded {
        std::mem::take(&mut *self.lock_discarded())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Run an optimistic mutation.
    ///
    /// The affected keys are locked for the whole mutation. The speculative
    /// update is visible immediately; on failure the entries are restored to
    /// exactly their prior state. Either way every key is refetched afterwards.
    #[tracing::instrument(skip(self, mutation, retry))]
    pub async fn mutate<M: Mutation<V>>(
        self: &Arc<Self>,
        mutation: &M,
        retry: RetryPolicy,
    ) -> Result<M::Output, QueryError> {
        let mut keys = mutation.keys();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_key(key).await);
        }

        let snapshots = self.apply_optimistic(mutation, &keys);

        let outcome = retry_with_backoff(retry.for_mutation(), "mutation", || mutation.execute()).await;

        match &outcome.result {
            Ok(output) => self.confirm_mutation(mutation, &snapshots, output),
            Err(err) => {
                warn!(error = %err, keys = snapshots.len(), "mutation failed, rolling back");
                self.rollback(snapshots.iter());
            }
        }
        drop(guards);

        for key in &keys {
            self.refetch_in_background(key);
        }
        outcome.result
    }

    fn apply_optimistic<M: Mutation<V>>(&self, mutation: &M, keys: &[QueryKey]) -> Vec<EntrySnapshot<V>> {
        let mut snapshots = Vec::new();
        for key in keys {
            {
                let Some(mut entry) = self.entries.get_mut(key) else {
                    continue;
                };
                snapshots.push(EntrySnapshot {
                    key: key.clone(),
                    value: entry.value.clone(),
                    error: entry.error.clone(),
                    fetched_at: entry.fetched_at,
                    retry_count: entry.retry_count,
                    invalidated: entry.invalidated,
                });
                entry.mutating += 1;
                if let Some(value) = entry.value.as_mut() {
                    mutation.apply(key, value);
                }
                entry.generation = self.next_generation();
            }
            self.notify(QueryEvent::Updated { key: key.clone() });
        }
        snapshots
    }

    fn confirm_mutation<M: Mutation<V>>(
        &self,
        mutation: &M,
        snapshots: &[EntrySnapshot<V>],
        output: &M::Output,
    ) {
        for snapshot in snapshots {
            {
                let Some(mut entry) = self.entries.get_mut(&snapshot.key) else {
                    continue;
                };
                if let Some(value) = entry.value.as_mut() {
                    mutation.confirm(&snapshot.key, value, output);
                }
                entry.mutating = entry.mutating.saturating_sub(1);
                entry.generation = self.next_generation();
            }
            self.notify(QueryEvent::Updated {
                key: snapshot.key.clone(),
            });
        }
    }

    fn rollback<'a>(&self, snapshots: impl Iterator<Item = &'a EntrySnapshot<V>>) {
        for snapshot in snapshots {
            {
                let Some(mut entry) = self.entries.get_mut(&snapshot.key) else {
                    continue;
                };
                entry.value = snapshot.value.clone();
                entry.error = snapshot.error.clone();
                entry.fetched_at = snapshot.fetched_at;
                entry.retry_count = snapshot.retry_count;
                entry.invalidated = snapshot.invalidated;
                entry.mutating = entry.mutating.saturating_sub(1);
                entry.generation = self.next_generation();
            }
            self.notify(QueryEvent::Updated {
                key: snapshot.key.clone(),
            });
        }
    }

    // =========================================================================
    // Observers and garbage collection
    // =========================================================================

    /// Register an active reader of `key`. The entry is never collected while
    /// the returned guard is alive.
    pub fn observe(self: &Arc<Self>, key: &QueryKey) -> QueryObserver<V> {
        let now = self.clock.now();
        let generation = self.next_generation();
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(QueryOptions::default(), now, generation))
            .subscribers += 1;
        QueryObserver {
            cache: Arc::downgrade(self),
            key: key.clone(),
        }
    }

    fn unobserve(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                entry.last_touched = self.clock.now();
            }
        }
    }

    /// Remove unobserved, idle entries older than their `gc_time`.
    pub fn gc(&self) -> usize {
        let now = self.clock.now();
        let fetching: HashSet<QueryKey> = self.inflight.iter().map(|e| e.key().clone()).collect();
        let mut collected = Vec::new();

        self.entries.retain(|key, entry| {
            let idle = (now - entry.last_touched).to_std().unwrap_or(Duration::ZERO);
            let keep = entry.subscribers > 0
                || entry.mutating > 0
                || fetching.contains(key)
                || idle < entry.options.gc_time;
            if !keep {
                collected.push(key.clone());
            }
            keep
        });

        for key in &collected {
            self.write_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
            self.notify(QueryEvent::Collected { key: key.clone() });
        }
        if !collected.is_empty() {
            debug!(collected = collected.len(), "garbage collected entries");
        }
        collected.len()
    }

    /// Run [`gc`](Self::gc) every `interval` until `shutdown` flips to true.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("gc task shutting down");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        cache.gc();
                    }
                }
            }
        })
    }

    // =========================================================================
    // Persistence hooks
    // =========================================================================

    /// Insert a restored entry. It is served immediately but marked stale so
    /// the first query revalidates it. Existing entries win.
    pub fn hydrate(&self, key: QueryKey, value: V, fetched_at: DateTime<Utc>, options: QueryOptions) {
        let now = self.clock.now();
        let generation = self.next_generation();
        if let Entry::Vacant(slot) = self.entries.entry(key) {
            let mut entry = CacheEntry::new(options, now, generation);
            entry.value = Some(value);
            entry.fetched_at = Some(fetched_at);
            entry.invalidated = true;
            slot.insert(entry);
        }
    }

    /// Successful entries that may be written to the snapshot, sorted by key.
    pub fn persistable_entries(&self) -> Vec<PersistableEntry<V>> {
        let mut out: Vec<PersistableEntry<V>> = self
            .entries
            .iter()
            .filter(|e| e.options.persist && e.error.is_none())
            .filter_map(|e| {
                let value = e.value.as_ref()?;
                if value.is_session_scoped() {
                    return None;
                }
                Some(PersistableEntry {
                    key: e.key().clone(),
                    value: value.clone(),
                    fetched_at: e.fetched_at?,
                })
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// RAII registration of an active reader; see [`QueryCache::observe`].
pub struct QueryObserver<V: CacheValue> {
    cache: Weak<QueryCache<V>>,
    key: QueryKey,
}

impl<V: CacheValue> QueryObserver<V> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl<V: CacheValue> Drop for QueryObserver<V> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.unobserve(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::query_key;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u32);

    impl CacheValue for Counter {}

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()))
    }

    fn counting_fetcher(calls: Arc<AtomicU32>) -> Fetcher<Counter> {
        fetcher_fn(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(Counter(n)) }
        })
    }

    fn options() -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(60))
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_without_refetch() {
        let cache = QueryCache::with_clock(clock());
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts", 1_i64];

        let first = cache.query(&key, counting_fetcher(calls.clone()), options()).await;
        assert_eq!(first.data, Some(Counter(1)));
        assert_eq!(first.status, EntryStatus::Fresh);

        let second = cache.query(&key, counting_fetcher(calls.clone()), options()).await;
        assert_eq!(second.data, Some(Counter(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_revalidated() {
        let clock = clock();
        let cache = QueryCache::with_clock(clock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts", 1_i64];

        cache.query(&key, counting_fetcher(calls.clone()), options()).await;
        clock.advance(chrono::Duration::seconds(61));

        let state = cache.query(&key, counting_fetcher(calls.clone()), options()).await;
        assert_eq!(state.status, EntryStatus::Stale);
        assert_eq!(state.data, Some(Counter(1)));

        for _ in 0..100 {
            if cache.get_data(&key) == Some(Counter(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(cache.get_data(&key), Some(Counter(2)));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_deduplicated() {
        let cache = QueryCache::with_clock(clock());
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["channels"];
        let c = calls.clone();
        let slow = fetcher_fn(move || {
            let c = c.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Counter(c.fetch_add(1, Ordering::SeqCst) + 1))
            }
        });

        let (a, b) = tokio::join!(
            cache.fetch_query(&key, slow.clone(), options()),
            cache.fetch_query(&key, slow.clone(), options()),
        );
        assert_eq!(a, Ok(Counter(1)));
        assert_eq!(b, Ok(Counter(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_superseded_fetch_result_is_discarded() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["posts"];
        let slow = fetcher_fn(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Counter(99))
        });

        let fetching = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.fetch_query(&key, slow, options()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set_data(&key, Counter(7)).await;

        assert_eq!(fetching.await.unwrap(), Ok(Counter(99)));
        assert_eq!(cache.get_data(&key), Some(Counter(7)));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_data() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["posts"];
        cache.set_data(&key, Counter(1)).await;

        let failing = fetcher_fn(|| async { Err::<Counter, _>(QueryError::NotFound("gone".into())) });
        let result = cache.fetch_query(&key, failing, options()).await;
        assert!(result.is_err());

        let state = cache.state(&key);
        assert_eq!(state.status, EntryStatus::Error);
        assert_eq!(state.data, Some(Counter(1)));
        assert_eq!(state.error, Some(QueryError::NotFound("gone".into())));
    }

    #[tokio::test]
    async fn test_disabled_query_never_fetches() {
        let cache = QueryCache::with_clock(clock());
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts"];

        let state = cache
            .query(&key, counting_fetcher(calls.clone()), options().with_enabled(false))
            .await;
        assert_eq!(state.status, EntryStatus::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_modifies_in_place() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["posts"];
        assert_eq!(cache.update(&key, |c: &mut Counter| c.0).await, None);

        cache.set_data(&key, Counter(1)).await;
        let seen = cache.update(&key, |c| {
            c.0 += 10;
            c.0
        })
        .await;
        assert_eq!(seen, Some(11));
        assert_eq!(cache.get_data(&key), Some(Counter(11)));
    }

    #[tokio::test]
    async fn test_invalidate_marks_prefix_stale() {
        let cache = QueryCache::with_clock(clock());
        cache.set_data(&query_key!["comments", 1_i64], Counter(1)).await;
        cache.set_data(&query_key!["comments", 2_i64], Counter(2)).await;
        cache.set_data(&query_key!["timeline", 2_i64], Counter(3)).await;

        assert_eq!(cache.invalidate(&query_key!["comments"]), 2);
        assert_eq!(cache.state(&query_key!["comments", 1_i64]).status, EntryStatus::Stale);
        assert_eq!(cache.invalidate(&query_key!["timeline", 3_i64]), 0);
    }

    #[tokio::test]
    async fn test_gc_respects_observers_and_gc_time() {
        let clock = clock();
        let cache = QueryCache::with_clock(clock.clone());
        let kept = query_key!["kept"];
        let dropped = query_key!["dropped"];
        cache.set_data(&kept, Counter(1)).await;
        cache.set_data(&dropped, Counter(2)).await;

        let observer = cache.observe(&kept);
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(cache.gc(), 1);
        assert!(cache.get_data(&dropped).is_none());
        assert!(cache.get_data(&kept).is_some());

        drop(observer);
        assert_eq!(cache.gc(), 0);
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(cache.gc(), 1);
        assert!(cache.is_empty());
    }

    struct AddMutation {
        key: QueryKey,
        delta: u32,
        fail: bool,
    }

    #[async_trait]
    impl Mutation<Counter> for AddMutation {
        type Output = u32;

        fn keys(&self) -> Vec<QueryKey> {
            vec![self.key.clone()]
        }

        fn apply(&self, _key: &QueryKey, value: &mut Counter) {
            value.0 += self.delta;
        }

        async fn execute(&self) -> Result<u32, QueryError> {
            if self.fail {
                Err(QueryError::Validation("rejected".into()))
            } else {
                Ok(1000)
            }
        }

        fn confirm(&self, _key: &QueryKey, value: &mut Counter, output: &u32) {
            value.0 = *output;
        }
    }

    #[tokio::test]
    async fn test_failed_mutation_restores_exact_snapshot() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["reactions"];
        cache.set_data(&key, Counter(5)).await;
        let before = cache.state(&key);

        let mutation = AddMutation {
            key: key.clone(),
            delta: 1,
            fail: true,
        };
        let result = cache.mutate(&mutation, RetryPolicy::none()).await;
        assert!(result.is_err());

        let after = cache.state(&key);
        assert_eq!(after.data, before.data);
        assert_eq!(after.fetched_at, before.fetched_at);
        assert_eq!(after.status, before.status);
    }

    #[tokio::test]
    async fn test_successful_mutation_confirms() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["reactions"];
        cache.set_data(&key, Counter(5)).await;

        let mutation = AddMutation {
            key: key.clone(),
            delta: 1,
            fail: false,
        };
        assert_eq!(cache.mutate(&mutation, RetryPolicy::none()).await, Ok(1000));
        assert_eq!(cache.get_data(&key), Some(Counter(1000)));
    }

    #[tokio::test]
    async fn test_persistable_entries_skip_session_scoped_and_errors() {
        #[derive(Debug, Clone)]
        struct Handle(bool);
        impl CacheValue for Handle {
            fn is_session_scoped(&self) -> bool {
                self.0
            }
        }

        let cache = QueryCache::<Handle>::with_clock(clock());
        cache.set_data(&query_key!["a"], Handle(false)).await;
        cache.set_data(&query_key!["b"], Handle(true)).await;
        let failing = fetcher_fn(|| async { Err::<Handle, _>(QueryError::Disabled("x".into())) });
        cache.set_data(&query_key!["c"], Handle(false)).await;
        let _ = cache.fetch_query(&query_key!["c"], failing, options()).await;

        let keys: Vec<QueryKey> = cache.persistable_entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![query_key!["a"]]);
    }

    #[tokio::test]
    async fn test_hydrated_entries_are_stale() {
        let cache = QueryCache::with_clock(clock());
        let key = query_key!["posts"];
        cache.hydrate(key.clone(), Counter(3), Utc::now(), options());
        let state = cache.state(&key);
        assert_eq!(state.status, EntryStatus::Stale);
        assert_eq!(state.data, Some(Counter(3)));
    }
}
