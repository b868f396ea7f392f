//! Comment threads.
//!
//! Trees are copy-on-write: every operation returns new root lists and only
//! the nodes on the path to a change are cloned. Untouched subtrees are
//! shared with the previous tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedline_cache::{
    Mutation, QueryCache, QueryError, QueryKey, QueryOptions, fetcher_fn, retry_with_backoff,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cached::CachedData;
use crate::error::FeedError;
use crate::keys;
use crate::live::{ApplyOutcome, IgnoreReason};
use crate::normalize::normalize_comment;
use crate::options::{CommentConfig, QueryPresets};
use crate::raw::{RawComment, RawCommentPage};
use crate::remote::{FetchComments, RemoteClient, SendComment};
use crate::types::{Author, ChannelId, Comment, CommentThread, MessageId};

/// Longest accepted comment, in characters.
pub const MAX_COMMENT_CHARS: usize = 4096;

/// How close in time a live comment must be to a pending one to be taken as
/// its confirmation when the server does not echo the client key.
const PENDING_MATCH_WINDOW_SECS: i64 = 60;

// =============================================================================
// Tree operations
// =============================================================================

/// Child-index path from the root list to every comment.
struct TreeIndex {
    paths: HashMap<MessageId, Vec<usize>>,
}

impl TreeIndex {
    fn build(roots: &[Arc<Comment>]) -> Self {
        fn walk(nodes: &[Arc<Comment>], prefix: &mut Vec<usize>, paths: &mut HashMap<MessageId, Vec<usize>>) {
            for (i, node) in nodes.iter().enumerate() {
                prefix.push(i);
                paths.entry(node.id).or_insert_with(|| prefix.clone());
                walk(&node.replies, prefix, paths);
                prefix.pop();
            }
        }
        let mut paths = HashMap::new();
        walk(roots, &mut Vec::new(), &mut paths);
        Self { paths }
    }

    fn path(&self, id: MessageId) -> Option<&[usize]> {
        self.paths.get(&id).map(Vec::as_slice)
    }
}

/// Clone the path to `path` and hand the target node to `f`.
fn with_node_mut<R>(roots: &mut [Arc<Comment>], path: &[usize], f: impl FnOnce(&mut Comment) -> R) -> Option<R> {
    let (first, rest) = path.split_first()?;
    let mut node = Arc::make_mut(roots.get_mut(*first)?);
    for i in rest {
        node = Arc::make_mut(node.replies.get_mut(*i)?);
    }
    Some(f(node))
}

pub fn find_by_id(roots: &[Arc<Comment>], id: MessageId) -> Option<Arc<Comment>> {
    for node in roots {
        if node.id == id {
            return Some(node.clone());
        }
        if let Some(found) = find_by_id(&node.replies, id) {
            return Some(found);
        }
    }
    None
}

/// Attach `comment` under `parent_id`.
///
/// Without a parent, or when the parent is not in the tree, the comment
/// becomes the newest root.
pub fn add_reply(roots: &[Arc<Comment>], parent_id: Option<MessageId>, mut comment: Comment) -> Vec<Arc<Comment>> {
    let mut out = roots.to_vec();
    let index = TreeIndex::build(roots);
    if let Some(path) = parent_id.and_then(|id| index.path(id)) {
        let attached = with_node_mut(&mut out, path, |parent| {
            if comment.reply_to_author.is_none() {
                comment.reply_to_author = Some(parent.author.name.clone());
            }
            parent.replies.push(Arc::new(comment.clone()));
        });
        if attached.is_some() {
            return out;
        }
    }
    if parent_id.is_some() {
        debug!(parent_id = ?parent_id, comment_id = comment.id, "parent not in tree, adding as root");
    }
    out.insert(0, Arc::new(comment));
    out
}

/// Apply `f` to the comment with `id`. `None` when it is not in the tree.
pub fn update_in_tree(
    roots: &[Arc<Comment>],
    id: MessageId,
    f: impl FnOnce(&mut Comment),
) -> Option<Vec<Arc<Comment>>> {
    let index = TreeIndex::build(roots);
    let path = index.path(id)?;
    let mut out = roots.to_vec();
    with_node_mut(&mut out, path, f)?;
    Some(out)
}

/// Strip the comments in `ids` from the tree.
///
/// Only the targeted comments are deleted. Replies under a stripped comment
/// are no longer reachable from the tree but were not deleted themselves.
/// Returns the new roots and how many targeted comments were found.
pub fn remove_by_ids(roots: &[Arc<Comment>], ids: &HashSet<MessageId>) -> (Vec<Arc<Comment>>, usize) {
    let mut removed = 0;
    let mut out = Vec::with_capacity(roots.len());
    for node in roots {
        if ids.contains(&node.id) {
            removed += 1 + count_targeted(&node.replies, ids);
            continue;
        }
        let (replies, below) = remove_by_ids(&node.replies, ids);
        if below == 0 {
            out.push(node.clone());
        } else {
            removed += below;
            let mut node = (**node).clone();
            node.replies = replies;
            out.push(Arc::new(node));
        }
    }
    (out, removed)
}

fn count_targeted(roots: &[Arc<Comment>], ids: &HashSet<MessageId>) -> usize {
    roots
        .iter()
        .map(|node| usize::from(ids.contains(&node.id)) + count_targeted(&node.replies, ids))
        .sum()
}

/// Every comment in the tree with its replies detached, in no particular order.
pub fn flatten(roots: &[Arc<Comment>]) -> Vec<Comment> {
    let mut out = Vec::new();
    let mut stack: Vec<&Arc<Comment>> = roots.iter().collect();
    while let Some(node) = stack.pop() {
        stack.extend(node.replies.iter());
        let mut flat = (**node).clone();
        flat.replies = Vec::new();
        out.push(flat);
    }
    out
}

/// Build a tree from flat comments linked by `reply_to_id`.
///
/// Roots are newest first, replies oldest first. Comments whose parent is
/// missing become roots. Duplicate ids keep the last occurrence.
pub fn build_forest(comments: Vec<Comment>) -> Vec<Arc<Comment>> {
    let mut by_id: HashMap<MessageId, Comment> = HashMap::with_capacity(comments.len());
    for c in comments {
        by_id.insert(c.id, c);
    }

    let mut children: HashMap<MessageId, Vec<MessageId>> = HashMap::new();
    let mut roots: Vec<MessageId> = Vec::new();
    for c in by_id.values() {
        match c.reply_to_id.filter(|p| *p != c.id && by_id.contains_key(p)) {
            Some(parent) => children.entry(parent).or_default().push(c.id),
            None => roots.push(c.id),
        }
    }

    let key = |id: &MessageId| by_id.get(id).map(|c| (c.date, c.id));
    roots.sort_by_key(|id| std::cmp::Reverse(key(id)));
    for list in children.values_mut() {
        list.sort_by_key(|id| key(id));
    }

    fn assemble(
        id: MessageId,
        parent_author: Option<&str>,
        by_id: &HashMap<MessageId, Comment>,
        children: &HashMap<MessageId, Vec<MessageId>>,
        visited: &mut HashSet<MessageId>,
    ) -> Option<Arc<Comment>> {
        if !visited.insert(id) {
            return None;
        }
        let mut node = by_id.get(&id)?.clone();
        if node.reply_to_author.is_none() {
            node.reply_to_author = parent_author.map(str::to_string);
        }
        node.replies = children
            .get(&id)
            .map(|kids| {
                kids.iter()
                    .filter_map(|k| assemble(*k, Some(&node.author.name), by_id, children, visited))
                    .collect()
            })
            .unwrap_or_default();
        Some(Arc::new(node))
    }

    let mut visited = HashSet::new();
    roots
        .into_iter()
        .filter_map(|id| assemble(id, None, &by_id, &children, &mut visited))
        .collect()
}

pub fn count_comments(roots: &[Arc<Comment>]) -> usize {
    roots.iter().map(|c| 1 + c.descendant_count()).sum()
}

/// Whether `incoming` is the server copy of the locally pending `pending`.
fn confirms(pending: &Comment, incoming: &Comment) -> bool {
    if !pending.pending {
        return false;
    }
    match (pending.client_key, incoming.client_key) {
        (Some(a), Some(b)) => a == b,
        _ => {
            pending.author.id == incoming.author.id
                && pending.text == incoming.text
                && (incoming.date - pending.date).num_seconds().abs() <= PENDING_MATCH_WINDOW_SECS
        }
    }
}

fn find_pending_match(roots: &[Arc<Comment>], incoming: &Comment) -> Option<MessageId> {
    flatten(roots)
        .into_iter()
        .find(|c| confirms(c, incoming))
        .map(|c| c.id)
}

/// Replace a node's content with `confirmed`, keeping its replies.
fn adopt(node: &mut Comment, confirmed: &Comment) {
    let replies = std::mem::take(&mut node.replies);
    let reply_to_author = node.reply_to_author.take();
    *node = confirmed.clone();
    node.replies = replies;
    if node.reply_to_author.is_none() {
        node.reply_to_author = reply_to_author;
    }
    node.pending = false;
}

fn thread_from_page(page: RawCommentPage, limit: usize) -> CommentThread {
    let root = page.root_message_id;
    let has_more = page.comments.len() >= limit && !page.comments.is_empty();
    let next_offset_id = page.comments.iter().map(|c| c.id).min();
    let comments = page
        .comments
        .iter()
        .map(|c| normalize_comment(c, root))
        .collect();
    CommentThread {
        total_count: page.total_count,
        comments: build_forest(comments),
        discussion_chat_id: page.discussion_chat_id,
        root_message_id: root,
        has_more,
        next_offset_id,
    }
}

/// Fold freshly fetched comments into an existing thread.
fn merge_comments(thread: &mut CommentThread, incoming: Vec<Comment>) {
    let mut flat = flatten(&thread.comments);
    let incoming_ids: HashSet<MessageId> = incoming.iter().map(|c| c.id).collect();
    flat.retain(|c| !incoming_ids.contains(&c.id) && !incoming.iter().any(|i| confirms(c, i)));
    flat.extend(incoming);
    thread.comments = build_forest(flat);
}

// =============================================================================
// Engine
// =============================================================================

pub struct CommentEngine {
    cache: Arc<QueryCache<CachedData>>,
    remote: Arc<dyn RemoteClient>,
    config: CommentConfig,
    me: OnceCell<Author>,
    last_temp_id: AtomicI64,
}

impl CommentEngine {
    pub fn new(cache: Arc<QueryCache<CachedData>>, remote: Arc<dyn RemoteClient>, config: CommentConfig) -> Self {
        Self {
            cache,
            remote,
            config,
            me: OnceCell::new(),
            last_temp_id: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &CommentConfig {
        &self.config
    }

    /// A negative placeholder id, strictly decreasing across calls.
    fn next_temp_id(&self, now: DateTime<Utc>) -> MessageId {
        let now_ms = now.timestamp_millis().max(1);
        let mut prev = self.last_temp_id.load(Ordering::SeqCst);
        loop {
            let next = now_ms.max(prev + 1);
            match self
                .last_temp_id
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return -next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn thread(&self, channel_id: ChannelId, message_id: MessageId) -> Option<CommentThread> {
        self.cache
            .get_data(&keys::comments_thread(channel_id, message_id))?
            .into_thread()
    }

    fn thread_fetcher(&self, key: QueryKey, channel_id: ChannelId, message_id: MessageId) -> feedline_cache::Fetcher<CachedData> {
        let cache = Arc::downgrade(&self.cache);
        let remote = self.remote.clone();
        let limit = self.config.page_size;
        fetcher_fn(move || {
            let cache = cache.clone();
            let remote = remote.clone();
            let key = key.clone();
            async move {
                let request = FetchComments {
                    limit,
                    offset_id: None,
                    reply_to: None,
                };
                let page = remote.fetch_comments(channel_id, message_id, request).await?;
                let fresh = thread_from_page(page, limit);
                let existing = cache
                    .upgrade()
                    .and_then(|c| c.get_data(&key))
                    .and_then(CachedData::into_thread);
                let thread = match existing {
                    Some(mut thread) => {
                        merge_comments(&mut thread, flatten(&fresh.comments));
                        thread.total_count = fresh.total_count;
                        thread.discussion_chat_id = fresh.discussion_chat_id;
                        thread.root_message_id = fresh.root_message_id;
                        thread
                    }
                    None => fresh,
                };
                Ok(CachedData::Thread(thread))
            }
        })
    }

    /// Load the newest page of the discussion under a post.
    #[tracing::instrument(skip(self))]
    pub async fn load_thread(&self, channel_id: ChannelId, message_id: MessageId) -> Result<CommentThread, FeedError> {
        let key = keys::comments_thread(channel_id, message_id);
        let fetcher = self.thread_fetcher(key.clone(), channel_id, message_id);
        let state = self.cache.query(&key, fetcher, QueryOptions::comments()).await;
        match (state.data.and_then(CachedData::into_thread), state.error) {
            (Some(thread), _) => Ok(thread),
            (None, Some(err)) => Err(err.into()),
            (None, None) => Err(FeedError::ThreadNotLoaded {
                channel_id,
                message_id,
            }),
        }
    }

    async fn fetch_page(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        request: FetchComments,
    ) -> Result<RawCommentPage, QueryError> {
        retry_with_backoff(QueryOptions::comments().retry, "comment page", || {
            self.remote.fetch_comments(channel_id, message_id, request)
        })
        .await
        .result
    }

    fn loaded(&self, channel_id: ChannelId, message_id: MessageId) -> Result<CommentThread, FeedError> {
        self.thread(channel_id, message_id)
            .ok_or(FeedError::ThreadNotLoaded {
                channel_id,
                message_id,
            })
    }

    /// Fetch the next older page of root-level comments.
    #[tracing::instrument(skip(self))]
    pub async fn load_more_comments(&self, channel_id: ChannelId, message_id: MessageId) -> Result<CommentThread, FeedError> {
        let thread = self.loaded(channel_id, message_id)?;
        if !thread.has_more {
            return Ok(thread);
        }
        let request = FetchComments {
            limit: self.config.page_size,
            offset_id: thread.next_offset_id,
            reply_to: None,
        };
        let page = self.fetch_page(channel_id, message_id, request).await?;
        let limit = self.config.page_size;
        let key = keys::comments_thread(channel_id, message_id);
        self.cache
            .update(&key, move |value| {
                let thread = value.as_thread_mut()?;
                let root = page.root_message_id.or(thread.root_message_id);
                thread.has_more = page.comments.len() >= limit && !page.comments.is_empty();
                thread.next_offset_id = page
                    .comments
                    .iter()
                    .map(|c| c.id)
                    .min()
                    .or(thread.next_offset_id);
                thread.total_count = page.total_count;
                let incoming = page.comments.iter().map(|c| normalize_comment(c, root)).collect();
                merge_comments(thread, incoming);
                Some(thread.clone())
            })
            .await
            .flatten()
            .ok_or(FeedError::ThreadNotLoaded {
                channel_id,
                message_id,
            })
    }

    /// Fetch the replies below `comment_id`, for threads nested deeper than
    /// the inline render depth.
    #[tracing::instrument(skip(self))]
    pub async fn load_subthread(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        comment_id: MessageId,
    ) -> Result<Arc<Comment>, FeedError> {
        self.loaded(channel_id, message_id)?;
        let request = FetchComments {
            limit: self.config.page_size,
            offset_id: None,
            reply_to: Some(comment_id),
        };
        let page = self.fetch_page(channel_id, message_id, request).await?;
        let key = keys::comments_thread(channel_id, message_id);
        self.cache
            .update(&key, move |value| {
                let thread = value.as_thread_mut()?;
                let root = page.root_message_id.or(thread.root_message_id);
                let incoming = page.comments.iter().map(|c| normalize_comment(c, root)).collect();
                merge_comments(thread, incoming);
                find_by_id(&thread.comments, comment_id)
            })
            .await
            .flatten()
            .ok_or(FeedError::CommentNotFound(comment_id))
    }

    /// Post a comment, showing it immediately.
    ///
    /// The thread must be loaded. On failure the thread is restored to exactly
    /// its prior state and the error is returned.
    #[tracing::instrument(skip(self, text))]
    pub async fn send_comment(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Arc<Comment>, FeedError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryError::Validation("comment text is empty".to_string()).into());
        }
        if text.chars().count() > MAX_COMMENT_CHARS {
            return Err(QueryError::Validation(format!(
                "comment is longer than {MAX_COMMENT_CHARS} characters"
            ))
            .into());
        }
        let thread = self.loaded(channel_id, message_id)?;
        let author = self
            .me
            .get_or_try_init(|| self.remote.current_user())
            .await?
            .clone();

        let now = self.cache.clock().now();
        let temp_id = self.next_temp_id(now);
        let client_key = Uuid::new_v4();
        let optimistic = Comment {
            id: temp_id,
            text: text.to_string(),
            entities: Vec::new(),
            author,
            date: now,
            edit_date: None,
            reply_to_id: reply_to,
            reply_to_author: None,
            replies: Vec::new(),
            media: None,
            reactions: Vec::new(),
            client_key: Some(client_key),
            pending: true,
        };
        let mutation = SubmitComment {
            key: keys::comments_thread(channel_id, message_id),
            root_message_id: thread.root_message_id,
            optimistic,
            request: SendComment {
                channel_id,
                message_id,
                text: text.to_string(),
                reply_to,
                client_key,
            },
            remote: self.remote.clone(),
        };

        let confirmed = self
            .cache
            .mutate(&mutation, QueryOptions::comments().retry)
            .await?;
        info!(comment_id = confirmed.id, temp_id, "comment confirmed");
        Ok(self
            .thread(channel_id, message_id)
            .and_then(|t| find_by_id(&t.comments, confirmed.id))
            .unwrap_or_else(|| Arc::new(confirmed)))
    }

    // =========================================================================
    // Live hooks
    // =========================================================================

    pub async fn apply_new(&self, channel_id: ChannelId, message_id: MessageId, raw: &RawComment) -> ApplyOutcome {
        let key = keys::comments_thread(channel_id, message_id);
        self.cache
            .update(&key, |value| {
                let Some(thread) = value.as_thread_mut() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Untracked);
                };
                let comment = normalize_comment(raw, thread.root_message_id);
                if find_by_id(&thread.comments, comment.id).is_some() {
                    return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
                }
                if let Some(temp_id) = find_pending_match(&thread.comments, &comment) {
                    debug!(temp_id, comment_id = comment.id, "live comment confirms pending one");
                    if let Some(roots) = update_in_tree(&thread.comments, temp_id, |node| adopt(node, &comment)) {
                        thread.comments = roots;
                    }
                    return ApplyOutcome::Applied;
                }
                let parent = comment.reply_to_id;
                thread.comments = add_reply(&thread.comments, parent, comment);
                thread.total_count += 1;
                ApplyOutcome::Applied
            })
            .await
            .unwrap_or(ApplyOutcome::Ignored(IgnoreReason::Untracked))
    }

    pub async fn apply_edit(&self, channel_id: ChannelId, message_id: MessageId, raw: &RawComment) -> ApplyOutcome {
        let key = keys::comments_thread(channel_id, message_id);
        self.cache
            .update(&key, |value| {
                let Some(thread) = value.as_thread_mut() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Untracked);
                };
                let edited = normalize_comment(raw, thread.root_message_id);
                let updated = update_in_tree(&thread.comments, edited.id, |node| {
                    node.text = edited.text.clone();
                    node.entities = edited.entities.clone();
                    node.edit_date = edited.edit_date;
                    node.reactions = edited.reactions.clone();
                });
                match updated {
                    Some(roots) => {
                        thread.comments = roots;
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Ignored(IgnoreReason::UnknownTarget),
                }
            })
            .await
            .unwrap_or(ApplyOutcome::Ignored(IgnoreReason::Untracked))
    }

    pub async fn apply_delete(&self, channel_id: ChannelId, message_id: MessageId, ids: &[MessageId]) -> ApplyOutcome {
        let key = keys::comments_thread(channel_id, message_id);
        let ids: HashSet<MessageId> = ids.iter().copied().collect();
        self.cache
            .update(&key, |value| {
                let Some(thread) = value.as_thread_mut() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Untracked);
                };
                let (roots, removed) = remove_by_ids(&thread.comments, &ids);
                if removed == 0 {
                    return ApplyOutcome::Ignored(IgnoreReason::UnknownTarget);
                }
                thread.comments = roots;
                thread.total_count = thread.total_count.saturating_sub(removed as u32);
                ApplyOutcome::Applied
            })
            .await
            .unwrap_or(ApplyOutcome::Ignored(IgnoreReason::Untracked))
    }
}

/// Optimistic comment submission.
struct SubmitComment {
    key: QueryKey,
    root_message_id: Option<MessageId>,
    optimistic: Comment,
    request: SendComment,
    remote: Arc<dyn RemoteClient>,
}

#[async_trait]
impl Mutation<CachedData> for SubmitComment {
    type Output = Comment;

    fn keys(&self) -> Vec<QueryKey> {
        vec![self.key.clone()]
    }

    fn apply(&self, _key: &QueryKey, value: &mut CachedData) {
        if let Some(thread) = value.as_thread_mut() {
            thread.comments = add_reply(&thread.comments, self.request.reply_to, self.optimistic.clone());
            thread.total_count += 1;
        }
    }

    async fn execute(&self) -> Result<Comment, QueryError> {
        let raw = self.remote.send_comment(self.request.clone()).await?;
        let mut confirmed = normalize_comment(&raw, self.root_message_id);
        confirmed.client_key = confirmed.client_key.or(Some(self.request.client_key));
        Ok(confirmed)
    }

    fn confirm(&self, _key: &QueryKey, value: &mut CachedData, confirmed: &Comment) {
        let Some(thread) = value.as_thread_mut() else {
            return;
        };
        let temp_id = self.optimistic.id;
        if find_by_id(&thread.comments, temp_id).is_none() {
            return;
        }
        if find_by_id(&thread.comments, confirmed.id).is_some() {
            let (roots, removed) = remove_by_ids(&thread.comments, &HashSet::from([temp_id]));
            thread.comments = roots;
            thread.total_count = thread.total_count.saturating_sub(removed as u32);
            return;
        }
        if let Some(roots) = update_in_tree(&thread.comments, temp_id, |node| adopt(node, confirmed)) {
            thread.comments = roots;
        }
    }
}

// =============================================================================
// Thread layout
// =============================================================================

/// One rendered row of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRow {
    Comment { comment: Arc<Comment>, depth: usize },
    /// Collapsed replies under `parent_id`; expanding is local.
    MoreReplies { parent_id: MessageId, hidden: usize, depth: usize },
    /// Replies nested too deep to render inline; opening them fetches the subthread.
    ContinueThread { comment_id: MessageId, hidden: usize, depth: usize },
}

/// Local expansion state for one thread.
#[derive(Debug, Clone)]
pub struct ThreadView {
    config: CommentConfig,
    expanded: HashSet<MessageId>,
}

impl ThreadView {
    pub fn new(config: CommentConfig) -> Self {
        Self {
            config,
            expanded: HashSet::new(),
        }
    }

    pub fn expand(&mut self, comment_id: MessageId) {
        self.expanded.insert(comment_id);
    }

    pub fn collapse(&mut self, comment_id: MessageId) {
        self.expanded.remove(&comment_id);
    }

    pub fn is_expanded(&self, comment_id: MessageId) -> bool {
        self.expanded.contains(&comment_id)
    }

    pub fn rows(&self, thread: &CommentThread) -> Vec<ThreadRow> {
        let mut rows = Vec::new();
        for root in &thread.comments {
            self.push_node(root, 0, &mut rows);
        }
        rows
    }

    /// Rows for a subtree opened from a continue-thread marker.
    pub fn subthread_rows(&self, comment: &Arc<Comment>) -> Vec<ThreadRow> {
        let mut rows = Vec::new();
        self.push_node(comment, 0, &mut rows);
        rows
    }

    fn push_node(&self, node: &Arc<Comment>, depth: usize, rows: &mut Vec<ThreadRow>) {
        rows.push(ThreadRow::Comment {
            comment: node.clone(),
            depth,
        });
        if node.replies.is_empty() {
            return;
        }
        let child_depth = depth + 1;
        if child_depth > self.config.max_depth {
            rows.push(ThreadRow::ContinueThread {
                comment_id: node.id,
                hidden: node.descendant_count(),
                depth: child_depth,
            });
            return;
        }
        let shown = if self.is_expanded(node.id) {
            node.replies.len()
        } else {
            node.replies.len().min(self.config.visible_replies)
        };
        for reply in &node.replies[..shown] {
            self.push_node(reply, child_depth, rows);
        }
        if shown < node.replies.len() {
            rows.push(ThreadRow::MoreReplies {
                parent_id: node.id,
                hidden: node.replies.len() - shown,
                depth: child_depth,
            });
        }
    }
}
