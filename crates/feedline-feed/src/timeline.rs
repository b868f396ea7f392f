//! Timeline aggregation.
//!
//! Per-channel pages are merged into one feed ordered newest first. A post is
//! only rendered once every channel that could still contribute something
//! newer has been fetched at least that far back, so paging never inserts
//! posts above the rendered cursor. Posts already shown stay shown; a channel
//! that only recovers after a failure may add posts above them.
//!
//! Albums are never split: any rendered member pulls in every stored member,
//! and a page whose oldest post belongs to an album triggers a backfill of the
//! whole album.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use feedline_cache::{
    QueryCache, QueryError, QueryKey, QueryOptions, codec, fetcher_fn, retry_with_backoff,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cached::CachedData;
use crate::error::FeedError;
use crate::groups::aggregate;
use crate::keys;
use crate::live::{ApplyOutcome, IgnoreReason};
use crate::normalize::normalize_post;
use crate::options::{QueryPresets, TimelineConfig};
use crate::remote::{FetchMessages, RemoteClient};
use crate::types::{ChannelId, FeedCursor, MessageId, Post, PostKey, TimelineItem, feed_order};

// =============================================================================
// Timeline data
// =============================================================================

/// Paging state for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCursor {
    /// Request older messages than this id next.
    pub before_id: Option<MessageId>,
    /// Everything the channel published at or after this position is stored.
    pub complete_to: Option<FeedCursor>,
    /// The channel has nothing older.
    pub exhausted: bool,
    /// Set when the last fetch for this channel failed.
    pub failed: Option<QueryError>,
}

/// Result of fetching one page for one channel.
#[derive(Debug, Clone)]
pub enum PageResult {
    Loaded {
        posts: Vec<Post>,
        /// The page was shorter than requested.
        exhausted: bool,
    },
    Failed(QueryError),
}

/// The cached source of truth for the feed. Timeline items are derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineData {
    channels: Vec<ChannelId>,
    /// Feed order, unique by [`PostKey`].
    posts: Vec<Post>,
    #[serde(with = "codec::pairs")]
    cursors: BTreeMap<ChannelId, ChannelCursor>,
    /// Live posts held back while the reader is away from the top.
    pending: Vec<Post>,
    /// Oldest position the reader has already been shown. Posts at or above
    /// it stay rendered whatever a late channel reports.
    #[serde(default)]
    shown_to: Option<FeedCursor>,
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn normalize_channels(channels: &[ChannelId]) -> Vec<ChannelId> {
    let mut channels = channels.to_vec();
    channels.sort_unstable();
    channels.dedup();
    channels
}

impl TimelineData {
    pub fn new(channels: &[ChannelId]) -> Self {
        let channels = normalize_channels(channels);
        let cursors = channels
            .iter()
            .map(|c| (*c, ChannelCursor::default()))
            .collect();
        Self {
            channels,
            cursors,
            ..Self::default()
        }
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn tracks(&self, channel_id: ChannelId) -> bool {
        self.channels.binary_search(&channel_id).is_ok()
    }

    pub fn cursor_for(&self, channel_id: ChannelId) -> Option<&ChannelCursor> {
        self.cursors.get(&channel_id)
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Look up a stored or pending post.
    pub fn post(&self, key: PostKey) -> Option<&Post> {
        self.posts
            .iter()
            .chain(self.pending.iter())
            .find(|p| p.key() == key)
    }

    pub fn post_mut(&mut self, key: PostKey) -> Option<&mut Post> {
        self.posts
            .iter_mut()
            .chain(self.pending.iter_mut())
            .find(|p| p.key() == key)
    }

    /// Oldest position every still-contributing channel has reached, never
    /// above what was already shown.
    fn cutoff(&self) -> Option<FeedCursor> {
        let reached = self
            .cursors
            .values()
            .filter(|c| !c.exhausted && c.failed.is_none())
            .filter_map(|c| c.complete_to)
            .max()?;
        Some(self.shown_to.map_or(reached, |shown| reached.min(shown)))
    }

    /// Keep everything at or above `cursor` rendered.
    pub fn hold_shown(&mut self, cursor: FeedCursor) {
        self.shown_to = min_opt(self.shown_to, Some(cursor));
    }

    /// Posts that can be rendered, in feed order.
    fn visible(&self) -> Vec<&Post> {
        let Some(cutoff) = self.cutoff() else {
            return self.posts.iter().collect();
        };
        let albums: HashSet<(ChannelId, i64)> = self
            .posts
            .iter()
            .filter(|p| p.feed_position() >= cutoff)
            .filter_map(|p| p.grouped_id.map(|g| (p.channel_id, g)))
            .collect();
        self.posts
            .iter()
            .filter(|p| {
                p.feed_position() >= cutoff
                    || p.grouped_id
                        .is_some_and(|g| albums.contains(&(p.channel_id, g)))
            })
            .collect()
    }

    pub fn items(&self) -> Vec<TimelineItem> {
        let visible: Vec<Post> = self.visible().into_iter().cloned().collect();
        aggregate(&visible)
    }

    /// Position of the oldest rendered post.
    pub fn cursor(&self) -> Option<FeedCursor> {
        self.visible().iter().map(|p| p.feed_position()).min()
    }

    fn top(&self) -> Option<FeedCursor> {
        self.visible().iter().map(|p| p.feed_position()).max()
    }

    pub fn has_more(&self) -> bool {
        self.cursors.values().any(|c| !c.exhausted) || self.visible().len() < self.posts.len()
    }

    pub fn failed_channels(&self) -> Vec<ChannelId> {
        self.cursors
            .iter()
            .filter(|(_, c)| c.failed.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Channels worth asking for an older page, with the id to page from.
    ///
    /// A channel whose head never loaded has no `before_id` and is asked for
    /// its newest page instead.
    fn older_page_requests(&self) -> Vec<(ChannelId, Option<MessageId>)> {
        self.cursors
            .iter()
            .filter(|(_, c)| !c.exhausted)
            .map(|(id, c)| (*id, c.before_id))
            .collect()
    }

    fn head_loaded(&self, channel_id: ChannelId) -> bool {
        self.cursor_for(channel_id)
            .is_some_and(|c| c.complete_to.is_some())
    }

    /// Merge a page fetched with the channel's current paging position.
    fn apply_next_page(&mut self, channel_id: ChannelId, result: PageResult) {
        if self.head_loaded(channel_id) {
            self.apply_older_page(channel_id, result);
        } else {
            self.apply_head_page(channel_id, result);
        }
    }

    fn failed_requests(&self) -> Vec<(ChannelId, Option<MessageId>)> {
        self.cursors
            .iter()
            .filter(|(_, c)| c.failed.is_some())
            .map(|(id, c)| (*id, c.before_id))
            .collect()
    }

    pub fn page(&self) -> FeedPage {
        FeedPage {
            items: self.items(),
            has_more: self.has_more(),
            cursor: self.cursor(),
            pending_count: self.pending_count(),
            failed_channels: self.failed_channels(),
        }
    }

    /// Insert or replace posts, keeping feed order and identity uniqueness.
    fn upsert(&mut self, incoming: Vec<Post>) {
        if incoming.is_empty() {
            return;
        }
        let mut index: HashMap<PostKey, usize> = self
            .posts
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key(), i))
            .collect();
        for post in incoming {
            let key = post.key();
            self.pending.retain(|p| p.key() != key);
            match index.get(&key) {
                Some(&i) => self.posts[i] = post,
                None => {
                    index.insert(key, self.posts.len());
                    self.posts.push(post);
                }
            }
        }
        self.posts.sort_by(feed_order);
    }

    /// Merge a page of older messages for `channel_id`.
    pub fn apply_older_page(&mut self, channel_id: ChannelId, result: PageResult) {
        let cursor = self.cursors.entry(channel_id).or_default();
        match result {
            PageResult::Failed(err) => {
                cursor.failed = Some(err);
            }
            PageResult::Loaded { posts, exhausted } => {
                cursor.before_id = min_opt(cursor.before_id, posts.iter().map(|p| p.id).min());
                cursor.complete_to =
                    min_opt(cursor.complete_to, posts.iter().map(|p| p.feed_position()).min());
                cursor.exhausted = exhausted;
                cursor.failed = None;
                self.upsert(posts);
            }
        }
    }

    /// Merge the newest page for `channel_id`.
    ///
    /// A full page that does not reach the newest stored post leaves a gap; the
    /// channel's older posts are dropped and paging restarts from this page.
    pub fn apply_head_page(&mut self, channel_id: ChannelId, result: PageResult) {
        let (posts, exhausted) = match result {
            PageResult::Failed(err) => {
                self.cursors.entry(channel_id).or_default().failed = Some(err);
                return;
            }
            PageResult::Loaded { posts, exhausted } => (posts, exhausted),
        };

        let newest_stored = self
            .posts
            .iter()
            .filter(|p| p.channel_id == channel_id)
            .map(|p| p.feed_position())
            .max();
        let page_oldest = posts.iter().map(|p| p.feed_position()).min();
        let gap = !exhausted
            && matches!((newest_stored, page_oldest), (Some(stored), Some(oldest)) if oldest > stored);

        let cursor = self.cursors.entry(channel_id).or_default();
        if gap {
            debug!(channel_id, "head page does not connect, restarting channel");
            *cursor = ChannelCursor::default();
            self.posts.retain(|p| p.channel_id != channel_id);
        }
        let cursor = self.cursors.entry(channel_id).or_default();
        cursor.before_id = min_opt(cursor.before_id, posts.iter().map(|p| p.id).min());
        cursor.complete_to = min_opt(cursor.complete_to, page_oldest);
        cursor.exhausted = exhausted || cursor.exhausted;
        cursor.failed = None;
        self.upsert(posts);
    }

    /// Merge a server-merged newest page across all channels.
    ///
    /// Every channel is complete down to the oldest post of the page, even
    /// channels that contributed nothing to it.
    pub fn apply_merged_head(&mut self, posts: Vec<Post>, limit: usize) {
        let exhausted = posts.len() < limit;
        let oldest = posts.iter().map(|p| p.feed_position()).min();
        for channel_id in self.channels.clone() {
            let own_min = posts
                .iter()
                .filter(|p| p.channel_id == channel_id)
                .map(|p| p.id)
                .min();
            let cursor = self.cursors.entry(channel_id).or_default();
            cursor.before_id = min_opt(cursor.before_id, own_min);
            cursor.complete_to = min_opt(cursor.complete_to, oldest);
            cursor.exhausted = cursor.exhausted || exhausted;
            cursor.failed = None;
        }
        let tracked: Vec<Post> = posts
            .into_iter()
            .filter(|p| self.tracks(p.channel_id))
            .collect();
        self.upsert(tracked);
    }

    /// Add a post delivered live.
    pub fn insert_live(&mut self, post: Post, scrolled_away: bool) -> ApplyOutcome {
        if !self.tracks(post.channel_id) {
            return ApplyOutcome::Ignored(IgnoreReason::Untracked);
        }
        let key = post.key();
        if let Some(existing) = self.pending.iter_mut().find(|p| p.key() == key) {
            *existing = post;
            return ApplyOutcome::Pending;
        }
        if let Some(existing) = self.posts.iter_mut().find(|p| p.key() == key) {
            *existing = post;
            return ApplyOutcome::Applied;
        }

        let above_top = self
            .top()
            .is_some_and(|top| post.feed_position() > top);
        if scrolled_away && above_top {
            self.pending.push(post);
            self.pending.sort_by(feed_order);
            return ApplyOutcome::Pending;
        }
        self.upsert(vec![post]);
        ApplyOutcome::Applied
    }

    /// Replace the mutable fields of a stored post.
    pub fn apply_edit(&mut self, edited: &Post) -> bool {
        let Some(post) = self.post_mut(edited.key()) else {
            return false;
        };
        post.text = edited.text.clone();
        post.entities = edited.entities.clone();
        post.edit_date = edited.edit_date;
        post.reactions = edited.reactions.clone();
        if edited.views.is_some() {
            post.views = edited.views;
        }
        if edited.replies.is_some() {
            post.replies = edited.replies;
        }
        true
    }

    /// Remove posts by id. Albums are regrouped on the next render.
    pub fn remove(&mut self, channel_id: ChannelId, ids: &[MessageId]) -> usize {
        let before = self.posts.len() + self.pending.len();
        let doomed = |p: &Post| p.channel_id == channel_id && ids.contains(&p.id);
        self.posts.retain(|p| !doomed(p));
        self.pending.retain(|p| !doomed(p));
        before - self.posts.len() - self.pending.len()
    }

    /// Splice held-back live posts into the feed. Returns how many were added.
    pub fn show_new_posts(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        self.upsert(pending);
        count
    }
}

/// What the reader sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub items: Vec<TimelineItem>,
    pub has_more: bool,
    /// Pass to [`TimelineEngine::load_more`] for the next page.
    pub cursor: Option<FeedCursor>,
    pub pending_count: usize,
    pub failed_channels: Vec<ChannelId>,
}

// =============================================================================
// Page fetching
// =============================================================================

#[derive(Clone)]
struct PageFetcher {
    remote: Arc<dyn RemoteClient>,
    config: TimelineConfig,
}

impl PageFetcher {
    async fn fetch_page(&self, channel_id: ChannelId, before_id: Option<MessageId>) -> PageResult {
        let request = FetchMessages {
            limit: self.config.page_size,
            before_id,
        };
        let outcome = retry_with_backoff(self.config.retry, "timeline page", || {
            self.remote.fetch_messages(channel_id, request)
        })
        .await;
        match outcome.result {
            Ok(raw) => PageResult::Loaded {
                exhausted: raw.len() < self.config.page_size,
                posts: raw.iter().map(normalize_post).collect(),
            },
            Err(err) => {
                warn!(channel_id, error = %err, "channel page failed");
                PageResult::Failed(err)
            }
        }
    }

    /// Fetch one page per request concurrently, then backfill albums cut at
    /// the page edge.
    async fn fetch_pages(
        &self,
        requests: Vec<(ChannelId, Option<MessageId>)>,
    ) -> Vec<(ChannelId, PageResult)> {
        let mut pages: Vec<(ChannelId, PageResult)> = join_all(
            requests
                .iter()
                .map(|(channel_id, before_id)| async move {
                    (*channel_id, self.fetch_page(*channel_id, *before_id).await)
                }),
        )
        .await;
        self.backfill_albums(&mut pages).await;
        pages
    }

    async fn backfill_albums(&self, pages: &mut [(ChannelId, PageResult)]) {
        let mut anchors: Vec<(usize, ChannelId, MessageId, i64)> = Vec::new();
        for (i, (channel_id, page)) in pages.iter().enumerate() {
            let PageResult::Loaded { posts, exhausted } = page else {
                continue;
            };
            if *exhausted {
                continue;
            }
            let oldest = posts.iter().min_by_key(|p| p.feed_position());
            if let Some(oldest) = oldest {
                if let Some(grouped_id) = oldest.grouped_id {
                    anchors.push((i, *channel_id, oldest.id, grouped_id));
                }
            }
        }
        if anchors.is_empty() {
            return;
        }

        debug!(albums = anchors.len(), "backfilling albums at page edge");
        let batch_size = self.config.backfill_batch_size.max(1);
        let batches: Vec<_> = anchors.chunks(batch_size).collect();
        let last = batches.len() - 1;
        for (n, batch) in batches.into_iter().enumerate() {
            let results = join_all(batch.iter().map(|(slot, channel_id, anchor, grouped_id)| async move {
                let result = self.remote.fetch_message_group(*channel_id, *anchor).await;
                (*slot, *channel_id, *grouped_id, result)
            }))
            .await;

            for (slot, channel_id, grouped_id, result) in results {
                match result {
                    Ok(raw) => {
                        if let PageResult::Loaded { posts, .. } = &mut pages[slot].1 {
                            let known: HashSet<MessageId> = posts.iter().map(|p| p.id).collect();
                            posts.extend(
                                raw.iter()
                                    .map(normalize_post)
                                    .filter(|p| p.channel_id == channel_id)
                                    .filter(|p| p.grouped_id == Some(grouped_id))
                                    .filter(|p| !known.contains(&p.id)),
                            );
                        }
                    }
                    Err(err) => warn!(channel_id, grouped_id, error = %err, "album backfill failed"),
                }
            }

            if n < last && !self.config.backfill_batch_delay.is_zero() {
                tokio::time::sleep(self.config.backfill_batch_delay).await;
            }
        }
    }

    /// Refresh the newest page of every channel in `data`.
    async fn load_heads(&self, data: &mut TimelineData) {
        let channels = data.channels().to_vec();
        match self.remote.fetch_timeline(&channels, self.config.page_size).await {
            Ok(Some(raw)) => {
                debug!(channels = channels.len(), "using merged timeline");
                data.apply_merged_head(raw.iter().map(normalize_post).collect(), self.config.page_size);
                return;
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "merged timeline unavailable, fetching per channel"),
        }

        let requests = channels.iter().map(|c| (*c, None)).collect();
        for (channel_id, page) in self.fetch_pages(requests).await {
            data.apply_head_page(channel_id, page);
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Builds and maintains the aggregated feed in the query cache.
pub struct TimelineEngine {
    pub(crate) cache: Arc<QueryCache<CachedData>>,
    pages: PageFetcher,
    pub(crate) config: TimelineConfig,
    key: RwLock<Option<QueryKey>>,
    scrolled_away: AtomicBool,
    paging: Mutex<()>,
}

impl TimelineEngine {
    pub fn new(
        cache: Arc<QueryCache<CachedData>>,
        remote: Arc<dyn RemoteClient>,
        config: TimelineConfig,
    ) -> Self {
        Self {
            cache,
            pages: PageFetcher { remote, config },
            config,
            key: RwLock::new(None),
            scrolled_away: AtomicBool::new(false),
            paging: Mutex::new(()),
        }
    }

    pub(crate) fn current_key(&self) -> Option<QueryKey> {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.pages.remote
    }

    fn data(&self) -> Option<(QueryKey, TimelineData)> {
        let key = self.current_key()?;
        let data = self.cache.get_data(&key)?.into_timeline()?;
        Some((key, data))
    }

    /// The current page, if the feed has been loaded.
    pub fn current(&self) -> Option<FeedPage> {
        self.data().map(|(_, data)| data.page())
    }

    pub fn set_scrolled_away(&self, away: bool) {
        self.scrolled_away.store(away, Ordering::SeqCst);
    }

    pub fn is_scrolled_away(&self) -> bool {
        self.scrolled_away.load(Ordering::SeqCst)
    }

    /// Whether live posts for `channel_id` belong in the current feed.
    pub fn tracks(&self, channel_id: ChannelId) -> bool {
        self.data().is_some_and(|(_, data)| data.tracks(channel_id))
    }

    fn head_fetcher(&self, key: QueryKey, channels: Vec<ChannelId>) -> feedline_cache::Fetcher<CachedData> {
        let cache: Weak<QueryCache<CachedData>> = Arc::downgrade(&self.cache);
        let pages = self.pages.clone();
        fetcher_fn(move || {
            let cache = cache.clone();
            let pages = pages.clone();
            let key = key.clone();
            let channels = channels.clone();
            async move {
                let existing = cache
                    .upgrade()
                    .and_then(|c| c.get_data(&key))
                    .and_then(CachedData::into_timeline)
                    .filter(|t| t.channels() == channels.as_slice());
                let mut data = existing.unwrap_or_else(|| TimelineData::new(&channels));
                pages.load_heads(&mut data).await;
                Ok(CachedData::Timeline(data))
            }
        })
    }

    /// Load the newest page of every channel and aggregate them.
    ///
    /// Fresh cached data is served as is; stale data is served and refreshed
    /// in the background.
    #[tracing::instrument(skip(self, channels), fields(channels = channels.len()))]
    pub async fn load(&self, channels: &[ChannelId]) -> Result<FeedPage, FeedError> {
        let channels = normalize_channels(channels);
        let key = keys::timeline(channels.len());
        let previous = self
            .key
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(key.clone());

        let same_set = self
            .cache
            .get_data(&key)
            .and_then(CachedData::into_timeline)
            .is_some_and(|t| t.channels() == channels.as_slice());
        if !same_set {
            if previous.as_ref() != Some(&key) {
                debug!(key = %key, "timeline key changed");
            }
            // A different set under the same key must not be served.
            self.cache.remove(&key);
        }

        let fetcher = self.head_fetcher(key.clone(), channels);
        let state = self.cache.query(&key, fetcher, QueryOptions::timeline()).await;
        match (state.data.and_then(CachedData::into_timeline), state.error) {
            (Some(data), _) => {
                let page = data.page();
                info!(items = page.items.len(), has_more = page.has_more, "timeline loaded");
                Ok(page)
            }
            (None, Some(err)) => Err(err.into()),
            (None, None) => Err(FeedError::TimelineNotLoaded),
        }
    }

    /// Fetch the page below `cursor`.
    ///
    /// Calls are serialized. A cursor that no longer matches the oldest
    /// rendered post returns the current page without fetching.
    #[tracing::instrument(skip(self))]
    pub async fn load_more(&self, cursor: FeedCursor) -> Result<FeedPage, FeedError> {
        let _paging = self.paging.lock().await;
        let (key, data) = self.data().ok_or(FeedError::TimelineNotLoaded)?;
        if data.cursor() != Some(cursor) {
            debug!("stale cursor, skipping fetch");
            return Ok(data.page());
        }
        if !data.has_more() {
            return Ok(data.page());
        }

        let pages = self.pages.fetch_pages(data.older_page_requests()).await;
        self.merge(&key, move |t| {
            t.hold_shown(cursor);
            for (channel_id, page) in pages {
                t.apply_next_page(channel_id, page);
            }
        })
        .await
    }

    /// Refetch only the channels whose last page failed.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<FeedPage, FeedError> {
        let _paging = self.paging.lock().await;
        let (key, data) = self.data().ok_or(FeedError::TimelineNotLoaded)?;
        let requests = data.failed_requests();
        if requests.is_empty() {
            return Ok(data.page());
        }
        info!(channels = requests.len(), "retrying failed channels");

        let shown = data.cursor();
        let pages = self.pages.fetch_pages(requests).await;
        self.merge(&key, move |t| {
            if let Some(shown) = shown {
                t.hold_shown(shown);
            }
            for (channel_id, page) in pages {
                t.apply_next_page(channel_id, page);
            }
        })
        .await
    }

    /// Splice pending live posts into the feed.
    pub async fn show_new_posts(&self) -> Result<FeedPage, FeedError> {
        let key = self.current_key().ok_or(FeedError::TimelineNotLoaded)?;
        self.merge(&key, |t| {
            let added = t.show_new_posts();
            debug!(added, "showing new posts");
        })
        .await
    }

    async fn merge<F>(&self, key: &QueryKey, f: F) -> Result<FeedPage, FeedError>
    where
        F: FnOnce(&mut TimelineData) + Send,
    {
        self.cache
            .update(key, |value| {
                let t = value.as_timeline_mut()?;
                f(t);
                Some(t.page())
            })
            .await
            .flatten()
            .ok_or(FeedError::TimelineNotLoaded)
    }

    // =========================================================================
    // Live hooks
    // =========================================================================

    pub async fn apply_new(&self, post: Post) -> ApplyOutcome {
        let Some(key) = self.current_key() else {
            return ApplyOutcome::Ignored(IgnoreReason::Untracked);
        };
        let scrolled_away = self.is_scrolled_away();
        self.cache
            .update(&key, |value| match value.as_timeline_mut() {
                Some(t) => t.insert_live(post, scrolled_away),
                None => ApplyOutcome::Ignored(IgnoreReason::Untracked),
            })
            .await
            .unwrap_or(ApplyOutcome::Ignored(IgnoreReason::Untracked))
    }

    /// Every cached timeline, whichever channel set it was built for.
    fn timeline_keys(&self) -> Vec<QueryKey> {
        let prefix = keys::timeline_prefix();
        self.cache
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect()
    }

    pub async fn apply_edit(&self, post: Post) -> ApplyOutcome {
        let mut applied = false;
        for key in self.timeline_keys() {
            applied |= self
                .cache
                .update(&key, |value| value.as_timeline_mut().is_some_and(|t| t.apply_edit(&post)))
                .await
                .unwrap_or(false);
        }
        if applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored(IgnoreReason::UnknownTarget)
        }
    }

    /// Remove posts from every cached timeline that holds them.
    pub async fn apply_delete(&self, channel_id: ChannelId, ids: &[MessageId]) -> ApplyOutcome {
        let mut removed = 0;
        for key in self.timeline_keys() {
            removed += self
                .cache
                .update(&key, |value| value.as_timeline_mut().map_or(0, |t| t.remove(channel_id, ids)))
                .await
                .unwrap_or(0);
        }
        if removed > 0 {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored(IgnoreReason::UnknownTarget)
        }
    }
}
