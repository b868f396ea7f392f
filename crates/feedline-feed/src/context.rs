//! Process-wide feed state with an explicit lifecycle.
//!
//! [`FeedContext::init`] restores the cache snapshot and starts the
//! background tasks. [`FeedContext::teardown`] is the logout path: it stops
//! everything and forgets all cached state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use feedline_cache::{
    Clock, KvStore, MediaCache, MediaIdentity, MediaState, Persister, QueryCache, QueryError,
    QueryOptions, RestoreOutcome, RetryPolicy, SystemClock, fetcher_fn, spawn_checkpointer,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cached::CachedData;
use crate::comments::CommentEngine;
use crate::directory::ChannelDirectory;
use crate::error::FeedError;
use crate::keys;
use crate::live::LiveReconciler;
use crate::options::{FeedConfig, QueryPresets};
use crate::remote::{RemoteClient, RemoteMediaSource, UnsubscribeHandle};
use crate::timeline::TimelineEngine;

pub struct FeedContext {
    config: FeedConfig,
    cache: Arc<QueryCache<CachedData>>,
    media: Arc<MediaCache>,
    persister: Arc<Persister<CachedData>>,
    remote: Arc<dyn RemoteClient>,
    timeline: Arc<TimelineEngine>,
    comments: Arc<CommentEngine>,
    directory: ChannelDirectory,
    live: Arc<LiveReconciler>,
    restored: RestoreOutcome,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<UnsubscribeHandle>>,
}

impl FeedContext {
    pub async fn init(
        config: FeedConfig,
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Self, FeedError> {
        Self::init_with_clock(config, store, remote, Arc::new(SystemClock)).await
    }

    #[tracing::instrument(skip_all, fields(version = %config.cache.cache_version))]
    pub async fn init_with_clock(
        config: FeedConfig,
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FeedError> {
        remote.connect().await?;

        let cache = QueryCache::with_clock(clock.clone());
        let media = MediaCache::new(
            config.cache.media_capacity,
            store.clone(),
            Arc::new(RemoteMediaSource(remote.clone())),
            QueryOptions::media().retry,
        );
        let persister = Arc::new(
            Persister::new(store, config.cache.clone(), clock).with_options(QueryOptions::for_key),
        );

        let restored = persister.restore(&cache).await?;
        if let RestoreOutcome::VersionMismatch { found } = &restored {
            let purged = media.purge_persisted().await?;
            info!(found = ?found, purged, "cache version changed, purged media bytes");
        }

        let timeline = Arc::new(TimelineEngine::new(cache.clone(), remote.clone(), config.timeline));
        let comments = Arc::new(CommentEngine::new(cache.clone(), remote.clone(), config.comments));
        let directory = ChannelDirectory::new(cache.clone(), remote.clone(), config.directory);
        let live = Arc::new(LiveReconciler::new(timeline.clone(), comments.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            cache.spawn_gc(config.cache.gc_interval, shutdown_rx.clone()),
            spawn_checkpointer(
                cache.clone(),
                persister.clone(),
                config.cache.checkpoint_interval,
                shutdown_rx,
            ),
        ];

        info!(restored = ?restored, "feed context ready");
        Ok(Self {
            config,
            cache,
            media,
            persister,
            remote,
            timeline,
            comments,
            directory,
            live,
            restored,
            shutdown,
            tasks: Mutex::new(tasks),
            subscription: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache<CachedData>> {
        &self.cache
    }

    pub fn media_cache(&self) -> &Arc<MediaCache> {
        &self.media
    }

    pub fn timeline(&self) -> &Arc<TimelineEngine> {
        &self.timeline
    }

    pub fn comments(&self) -> &Arc<CommentEngine> {
        &self.comments
    }

    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn live(&self) -> &Arc<LiveReconciler> {
        &self.live
    }

    /// What the snapshot restore found at startup.
    pub fn restored(&self) -> &RestoreOutcome {
        &self.restored
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the live-update subscription and start applying it. A second
    /// call while subscribed does nothing.
    pub async fn start_live(&self) -> Result<(), FeedError> {
        if self.live.is_torn_down() {
            return Ok(());
        }
        if self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Ok(());
        }
        let subscription = self.remote.subscribe().await?;
        let task = self.live.spawn(subscription.events, self.shutdown.subscribe());
        self.tasks().push(task);
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription.handle);
        info!("live updates started");
        Ok(())
    }

    /// Resolve media bytes to a handle, going through the query cache so
    /// repeated renders share one entry.
    pub async fn media(&self, identity: &MediaIdentity) -> MediaState {
        let key = identity.query_key();
        let stale_handle = self
            .cache
            .get_data(&key)
            .and_then(|d| d.as_media().cloned())
            .is_some_and(|h| !self.media.registry().is_live(&h));
        if stale_handle {
            // Evicted from the LRU; the cached handle no longer resolves.
            self.cache.remove(&key);
        }

        let media = Arc::downgrade(&self.media);
        let target = identity.clone();
        let fetcher = fetcher_fn(move || {
            let media = media.clone();
            let target = target.clone();
            async move {
                let media = media
                    .upgrade()
                    .ok_or_else(|| QueryError::Unknown("media cache dropped".to_string()))?;
                media.try_resolve(&target).await.map(CachedData::Media)
            }
        });
        // The media cache retries downloads itself.
        let options = QueryOptions::media().with_retry(RetryPolicy::none());
        let state = self.cache.query(&key, fetcher, options).await;
        match (state.data, state.error) {
            (Some(CachedData::Media(handle)), _) => MediaState::Ready(handle),
            (_, Some(err)) => MediaState::Unavailable(err),
            _ => MediaState::Unavailable(QueryError::NotFound(identity.to_string())),
        }
    }

    /// Mark the feed and every loaded thread stale. Observed entries refetch
    /// in the background; the rest refetch on their next read.
    pub fn refresh(&self) -> usize {
        let marked = self.cache.invalidate(&keys::timeline_prefix())
            + self.cache.invalidate(&keys::comments_prefix());
        debug!(marked, "refresh requested");
        marked
    }

    /// Write the current cache state to the store now.
    pub async fn checkpoint(&self) -> Result<usize, FeedError> {
        Ok(self.persister.checkpoint(&self.cache).await?)
    }

    async fn stop_tasks(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }

    /// Stop background work after a final checkpoint. Cached state stays in
    /// the store for the next start.
    pub async fn shutdown(&self) {
        self.stop_tasks().await;
        debug!("feed context shut down");
    }

    /// Logout: stop live delivery and background tasks, then drop every
    /// cached entry, media handle and the stored snapshot.
    pub async fn teardown(&self) -> Result<(), FeedError> {
        self.live.teardown();
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = subscription {
            handle.unsubscribe();
        }
        self.stop_tasks().await;

        self.cache.clear();
        self.media.clear();
        self.persister.delete().await?;
        info!("feed context torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use feedline_cache::{ManualClock, MemoryStore, SizeVariant};

    use super::*;
    use crate::fixture::FixtureRemote;
    use crate::raw::{RawMedia, RawMessage};

    fn photo_message(id: i64) -> RawMessage {
        RawMessage {
            id,
            channel_id: 1,
            date: 1_700_000_000 + id,
            edit_date: None,
            message: format!("post {id}"),
            entities: vec![],
            media: Some(RawMedia {
                kind: "photo".into(),
                mime_type: None,
                width: None,
                height: None,
                duration: None,
                file_name: None,
                size: None,
                has_thumb: true,
            }),
            grouped_id: None,
            views: None,
            replies: None,
            reactions: vec![],
        }
    }

    fn remote() -> Arc<FixtureRemote> {
        Arc::new(
            FixtureRemote::default()
                .with_channel(1, "one")
                .with_message(photo_message(1))
                .with_message(photo_message(2)),
        )
    }

    async fn init(store: Arc<MemoryStore>, remote: Arc<FixtureRemote>) -> FeedContext {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        FeedContext::init_with_clock(FeedConfig::default(), store, remote, clock)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_restart_restores_timeline() {
        let store = Arc::new(MemoryStore::new());
        let first = init(store.clone(), remote()).await;
        assert!(matches!(first.restored(), RestoreOutcome::VersionMismatch { found: None }));
        first.timeline().load(&[1]).await.unwrap();
        first.checkpoint().await.unwrap();
        first.shutdown().await;

        let second = init(store, remote()).await;
        assert!(matches!(second.restored(), RestoreOutcome::Hydrated { entries: 1 }));
    }

    #[tokio::test]
    async fn test_media_is_shared_between_renders() {
        let remote = remote();
        let ctx = init(Arc::new(MemoryStore::new()), remote.clone()).await;
        let identity = MediaIdentity::Message {
            channel_id: 1,
            message_id: 1,
            size: SizeVariant::Thumb,
        };
        let first = ctx.media(&identity).await;
        let second = ctx.media(&identity).await;
        assert_eq!(first, second);
        assert_eq!(remote.downloads(), 1);
        let handle = first.handle().unwrap();
        assert_eq!(ctx.media_cache().read(handle).as_deref(), Some(&b"media:msg:1:1:thumb"[..]));
    }

    #[tokio::test]
    async fn test_missing_media_is_a_placeholder() {
        let ctx = init(Arc::new(MemoryStore::new()), remote()).await;
        let identity = MediaIdentity::Profile {
            peer_id: 1,
            size: SizeVariant::Thumb,
        };
        assert!(matches!(ctx.media(&identity).await, MediaState::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_refresh_marks_feed_and_threads() {
        let ctx = init(Arc::new(MemoryStore::new()), remote()).await;
        assert_eq!(ctx.refresh(), 0);
        ctx.timeline().load(&[1]).await.unwrap();
        ctx.directory().channels().await.unwrap();
        assert_eq!(ctx.refresh(), 1);
    }

    #[tokio::test]
    async fn test_teardown_forgets_everything() {
        let store = Arc::new(MemoryStore::new());
        let remote = remote();
        let ctx = init(store.clone(), remote.clone()).await;
        ctx.timeline().load(&[1]).await.unwrap();
        ctx.start_live().await.unwrap();
        ctx.checkpoint().await.unwrap();

        ctx.teardown().await.unwrap();
        assert!(ctx.cache().is_empty());
        assert!(ctx.live().is_torn_down());
        assert!(!remote.emit_event(crate::live::LiveEvent::DeleteMessages {
            channel_id: 1,
            ids: vec![1],
        }));

        let key = ctx.config().cache.snapshot_key.clone();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
