//! Tiered media cache: memory LRU, then persisted bytes, then the network.
//!
//! Handles are minted from bytes by the [`BlobRegistry`] and only resolve in
//! the session that minted them. Bytes are persisted; handles never are.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{QueryError, StoreError};
use crate::key::QueryKey;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::KvStore;

/// Storage key prefix shared by every persisted media blob.
pub const MEDIA_KEY_PREFIX: &str = "media:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeVariant {
    Thumb,
    Full,
}

impl SizeVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeVariant::Thumb => "thumb",
            SizeVariant::Full => "full",
        }
    }
}

impl fmt::Display for SizeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a piece of media is, independent of where its bytes live.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaIdentity {
    Message {
        channel_id: i64,
        message_id: i64,
        size: SizeVariant,
    },
    Profile {
        peer_id: i64,
        size: SizeVariant,
    },
}

impl MediaIdentity {
    /// Key used in the persistent store.
    pub fn storage_key(&self) -> String {
        match self {
            MediaIdentity::Message {
                channel_id,
                message_id,
                size,
            } => format!("{MEDIA_KEY_PREFIX}msg:{channel_id}:{message_id}:{size}"),
            MediaIdentity::Profile { peer_id, size } => {
                format!("{MEDIA_KEY_PREFIX}profile:{peer_id}:{size}")
            }
        }
    }

    /// Key used in the query cache.
    pub fn query_key(&self) -> QueryKey {
        match self {
            MediaIdentity::Message {
                channel_id,
                message_id,
                size,
            } => QueryKey::new("media")
                .with("download")
                .with(*channel_id)
                .with(*message_id)
                .with(size.as_str()),
            MediaIdentity::Profile { peer_id, size } => QueryKey::new("media")
                .with("profile")
                .with(*peer_id)
                .with(size.as_str()),
        }
    }
}

impl fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Where media bytes come from when no local tier has them.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn download(&self, identity: &MediaIdentity) -> Result<Vec<u8>, QueryError>;
}

// =============================================================================
// Blob registry
// =============================================================================

/// A session-scoped reference to bytes held by a [`BlobRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    session: Uuid,
    id: u64,
    len: usize,
}

impl ResourceHandle {
    pub fn url(&self) -> String {
        format!("blob:feedline/{}/{}", self.session, self.id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Holds the bytes behind live handles for one session.
#[derive(Debug)]
pub struct BlobRegistry {
    session: Uuid,
    next: AtomicU64,
    live: DashMap<u64, Arc<[u8]>>,
}

impl Default for BlobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self {
            session: Uuid::new_v4(),
            next: AtomicU64::new(0),
            live: DashMap::new(),
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn mint(&self, bytes: Vec<u8>) -> ResourceHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let len = bytes.len();
        self.live.insert(id, Arc::from(bytes));
        ResourceHandle {
            session: self.session,
            id,
            len,
        }
    }

    /// Bytes behind `handle`, if it was minted here and not yet revoked.
    pub fn read(&self, handle: &ResourceHandle) -> Option<Arc<[u8]>> {
        if handle.session != self.session {
            return None;
        }
        self.live.get(&handle.id).map(|b| Arc::clone(b.value()))
    }

    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        handle.session == self.session && self.live.contains_key(&handle.id)
    }

    pub fn revoke(&self, handle: &ResourceHandle) -> bool {
        handle.session == self.session && self.live.remove(&handle.id).is_some()
    }

    pub fn revoke_all(&self) -> usize {
        let count = self.live.len();
        self.live.clear();
        count
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

// =============================================================================
// Media cache
// =============================================================================

/// Result of [`MediaCache::resolve`]; failures become a placeholder state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaState {
    Ready(ResourceHandle),
    Unavailable(QueryError),
}

impl MediaState {
    pub fn handle(&self) -> Option<&ResourceHandle> {
        match self {
            MediaState::Ready(h) => Some(h),
            MediaState::Unavailable(_) => None,
        }
    }
}

type SharedResolve = Shared<BoxFuture<'static, Result<ResourceHandle, QueryError>>>;

pub struct MediaCache {
    lru: Mutex<LruCache<MediaIdentity, ResourceHandle>>,
    store: Arc<dyn KvStore>,
    source: Arc<dyn MediaSource>,
    registry: Arc<BlobRegistry>,
    inflight: DashMap<MediaIdentity, SharedResolve>,
    retry: RetryPolicy,
}

impl MediaCache {
    /// A capacity of zero is treated as one.
    pub fn new(
        capacity: usize,
        store: Arc<dyn KvStore>,
        source: Arc<dyn MediaSource>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))),
            store,
            source,
            registry: Arc::new(BlobRegistry::new()),
            inflight: DashMap::new(),
            retry,
        })
    }

    pub fn registry(&self) -> &Arc<BlobRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.lock_lru().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_lru().is_empty()
    }

    pub fn contains(&self, identity: &MediaIdentity) -> bool {
        self.lock_lru().contains(identity)
    }

    /// Bytes behind a handle minted by this cache.
    pub fn read(&self, handle: &ResourceHandle) -> Option<Arc<[u8]>> {
        self.registry.read(handle)
    }

    fn lock_lru(&self) -> std::sync::MutexGuard<'_, LruCache<MediaIdentity, ResourceHandle>> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup_memory(&self, identity: &MediaIdentity) -> Option<ResourceHandle> {
        let mut lru = self.lock_lru();
        let handle = lru.get(identity)?.clone();
        if self.registry.is_live(&handle) {
            return Some(handle);
        }
        lru.pop(identity);
        None
    }

    fn remember(&self, identity: MediaIdentity, bytes: Vec<u8>) -> ResourceHandle {
        let handle = self.registry.mint(bytes);
        let pushed_out = self.lock_lru().push(identity, handle.clone());
        if let Some((evicted, old)) = pushed_out {
            self.registry.revoke(&old);
            trace!(identity = %evicted, "evicted media handle");
        }
        handle
    }

    /// Resolve `identity` to a handle, never surfacing an error.
    pub async fn resolve(self: &Arc<Self>, identity: &MediaIdentity) -> MediaState {
        match self.try_resolve(identity).await {
            Ok(handle) => MediaState::Ready(handle),
            Err(e) => {
                debug!(identity = %identity, error = %e, "media unavailable");
                MediaState::Unavailable(e)
            }
        }
    }

    /// Resolve `identity`, sharing one lookup between concurrent callers.
    pub async fn try_resolve(self: &Arc<Self>, identity: &MediaIdentity) -> Result<ResourceHandle, QueryError> {
        if let Some(handle) = self.lookup_memory(identity) {
            trace!(identity = %identity, "media memory hit");
            return Ok(handle);
        }

        let shared = match self.inflight.entry(identity.clone()) {
            Entry::Occupied(slot) => slot.get().clone(),
            Entry::Vacant(slot) => {
                let fut = Self::load(Arc::downgrade(self), identity.clone()).boxed().shared();
                slot.insert(fut.clone());
                fut
            }
        };
        shared.await
    }

    async fn load(cache: Weak<Self>, identity: MediaIdentity) -> Result<ResourceHandle, QueryError> {
        let Some(this) = cache.upgrade() else {
            return Err(QueryError::Unknown("media cache dropped".to_string()));
        };
        let result = this.load_uncached(&identity).await;
        this.inflight.remove(&identity);
        result
    }

    async fn load_uncached(&self, identity: &MediaIdentity) -> Result<ResourceHandle, QueryError> {
        let storage_key = identity.storage_key();
        match self.store.get(&storage_key).await {
            Ok(Some(bytes)) => {
                trace!(identity = %identity, "media store hit");
                return Ok(self.remember(identity.clone(), bytes));
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "media store read failed"),
        }

        let label = storage_key.clone();
        let outcome = retry_with_backoff(self.retry, &label, || self.source.download(identity)).await;
        let bytes = outcome.result?;
        debug!(identity = %identity, bytes = bytes.len(), retries = outcome.retries, "downloaded media");

        if let Err(e) = self.store.set(&storage_key, bytes.clone()).await {
            warn!(identity = %identity, error = %e, "failed to persist media bytes");
        }
        Ok(self.remember(identity.clone(), bytes))
    }

    /// Drop every in-memory handle and free its bytes.
    pub fn clear(&self) {
        let entries = {
            let mut lru = self.lock_lru();
            let entries = lru.len();
            lru.clear();
            entries
        };
        self.inflight.clear();
        let revoked = self.registry.revoke_all();
        debug!(entries, revoked, "cleared media cache");
    }

    /// Delete every persisted media blob.
    pub async fn purge_persisted(&self) -> Result<usize, StoreError> {
        let keys = self.store.keys_with_prefix(MEDIA_KEY_PREFIX).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        debug!(count = keys.len(), "purged persisted media");
        Ok(keys.len())
    }
}
