//! An in-memory [`RemoteClient`] driven by a JSON fixture.
//!
//! Used by tests and by the `feedline replay` command. Failures can be
//! injected per channel and per operation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use feedline_cache::{MediaIdentity, QueryError, SizeVariant};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FeedError;
use crate::live::{LiveEnvelope, LiveEvent};
use crate::raw::{DialogKind, RawComment, RawCommentPage, RawDialog, RawMessage, RawReactionCount};
use crate::remote::{
    FetchComments, FetchMessages, LiveSubscription, RemoteClient, SendComment, UnsubscribeHandle,
};
use crate::types::{Author, ChannelId, MessageId};

const LIVE_BUFFER: usize = 256;

fn default_true() -> bool {
    true
}

/// The discussion under one post.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureThread {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub discussion_chat_id: Option<i64>,
    pub root_message_id: Option<MessageId>,
    /// Comments are turned off for this post.
    pub disabled: bool,
    pub comments: Vec<RawComment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub me: Author,
    pub channels: Vec<RawDialog>,
    pub messages: Vec<RawMessage>,
    pub threads: Vec<FixtureThread>,
    /// Events delivered by [`FixtureRemote::replay_live`].
    pub live: Vec<LiveEnvelope>,
    /// Media payloads by storage key, base64 encoded. Anything else gets
    /// generated bytes.
    pub media: BTreeMap<String, String>,
    /// Serve a pre-merged timeline instead of per-channel pages.
    pub merged_timeline: bool,
    /// Echo the client key on created comments.
    #[serde(default = "default_true")]
    pub echo_client_key: bool,
    /// Deliver a live event for every comment sent.
    pub echo_live: bool,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            me: Author {
                id: 1,
                name: "me".to_string(),
            },
            channels: Vec::new(),
            messages: Vec::new(),
            threads: Vec::new(),
            live: Vec::new(),
            media: BTreeMap::new(),
            merged_timeline: false,
            echo_client_key: true,
            echo_live: false,
        }
    }
}

#[derive(Default)]
struct Failures {
    channels: HashMap<ChannelId, QueryError>,
    next_send: Option<QueryError>,
    reactions: Option<QueryError>,
    media: Option<QueryError>,
}

pub struct FixtureRemote {
    data: Mutex<Fixture>,
    failures: Mutex<Failures>,
    live: Arc<Mutex<Option<mpsc::Sender<LiveEnvelope>>>>,
    next_seq: AtomicU64,
    page_fetches: AtomicUsize,
    downloads: AtomicUsize,
}

impl Default for FixtureRemote {
    fn default() -> Self {
        Self::new(Fixture::default())
    }
}

impl FixtureRemote {
    pub fn new(fixture: Fixture) -> Self {
        let next_seq = fixture.live.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        Self {
            data: Mutex::new(fixture),
            failures: Mutex::new(Failures::default()),
            live: Arc::new(Mutex::new(None)),
            next_seq: AtomicU64::new(next_seq),
            page_fetches: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, FeedError> {
        Ok(Self::new(serde_json::from_str(text)?))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }

    fn data(&self) -> MutexGuard<'_, Fixture> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Builders and controls
    // =========================================================================

    pub fn with_channel(self, id: ChannelId, title: &str) -> Self {
        self.data().channels.push(RawDialog {
            id,
            title: title.to_string(),
            kind: DialogKind::Broadcast,
            username: None,
            has_photo: false,
        });
        self
    }

    pub fn with_message(self, message: RawMessage) -> Self {
        self.push_message(message);
        self
    }

    pub fn with_thread(self, thread: FixtureThread) -> Self {
        self.data().threads.push(thread);
        self
    }

    /// Publish a message so later fetches see it.
    pub fn push_message(&self, message: RawMessage) {
        let mut data = self.data();
        data.messages
            .retain(|m| !(m.channel_id == message.channel_id && m.id == message.id));
        data.messages.push(message);
    }

    pub fn fail_channel(&self, channel_id: ChannelId, error: QueryError) {
        self.failures().channels.insert(channel_id, error);
    }

    pub fn heal_channel(&self, channel_id: ChannelId) {
        self.failures().channels.remove(&channel_id);
    }

    pub fn fail_next_send(&self, error: QueryError) {
        self.failures().next_send = Some(error);
    }

    pub fn fail_reactions(&self, error: Option<QueryError>) {
        self.failures().reactions = error;
    }

    pub fn fail_media(&self, error: Option<QueryError>) {
        self.failures().media = error;
    }

    /// Per-channel page requests served so far.
    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    /// Media and profile photo downloads served so far.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn live_events(&self) -> Vec<LiveEnvelope> {
        self.data().live.clone()
    }

    /// Push an envelope to the open subscription. `false` when nobody listens.
    pub fn emit(&self, envelope: LiveEnvelope) -> bool {
        let sender = self.live.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sender {
            Some(tx) => tx.try_send(envelope).is_ok(),
            None => false,
        }
    }

    /// Emit an event with the next sequence number.
    pub fn emit_event(&self, event: LiveEvent) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.emit(LiveEnvelope { seq, event })
    }

    /// Emit every fixture event. Returns the highest sequence number sent.
    pub fn replay_live(&self) -> u64 {
        let events = self.live_events();
        let mut last = 0;
        for envelope in events {
            let seq = envelope.seq;
            if self.emit(envelope) {
                last = last.max(seq);
            }
        }
        debug!(last_seq = last, "replayed fixture events");
        last
    }

    fn check_channel(&self, channel_id: ChannelId) -> Result<(), QueryError> {
        match self.failures().channels.get(&channel_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn thread_mut(data: &mut Fixture, channel_id: ChannelId, message_id: MessageId) -> Result<&mut FixtureThread, QueryError> {
    let thread = data
        .threads
        .iter_mut()
        .find(|t| t.channel_id == channel_id && t.message_id == message_id)
        .ok_or_else(|| QueryError::NotFound(format!("no discussion for {channel_id}/{message_id}")))?;
    if thread.disabled {
        return Err(QueryError::Disabled(format!(
            "comments are disabled for {channel_id}/{message_id}"
        )));
    }
    Ok(thread)
}

/// Whether `id` sits somewhere below `ancestor` in the reply chain.
fn descends_from(comments: &[RawComment], id: MessageId, ancestor: MessageId) -> bool {
    let parents: HashMap<MessageId, Option<MessageId>> =
        comments.iter().map(|c| (c.id, c.reply_to_msg_id)).collect();
    let mut current = parents.get(&id).copied().flatten();
    let mut hops = 0;
    while let Some(parent) = current {
        if parent == ancestor {
            return true;
        }
        hops += 1;
        if hops > comments.len() {
            return false;
        }
        current = parents.get(&parent).copied().flatten();
    }
    false
}

#[async_trait]
impl RemoteClient for FixtureRemote {
    async fn connect(&self) -> Result<(), QueryError> {
        Ok(())
    }

    async fn current_user(&self) -> Result<Author, QueryError> {
        Ok(self.data().me.clone())
    }

    async fn iterate_dialogs(&self, max: usize) -> Result<Vec<RawDialog>, QueryError> {
        Ok(self.data().channels.iter().take(max).cloned().collect())
    }

    async fn fetch_messages(&self, channel_id: ChannelId, request: FetchMessages) -> Result<Vec<RawMessage>, QueryError> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_channel(channel_id)?;
        let data = self.data();
        let mut page: Vec<RawMessage> = data
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .filter(|m| request.before_id.is_none_or(|before| m.id < before))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(request.limit);
        Ok(page)
    }

    async fn fetch_timeline(&self, channels: &[ChannelId], limit: usize) -> Result<Option<Vec<RawMessage>>, QueryError> {
        let data = self.data();
        if !data.merged_timeline {
            return Ok(None);
        }
        let mut page: Vec<RawMessage> = data
            .messages
            .iter()
            .filter(|m| channels.contains(&m.channel_id))
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.date, b.id).cmp(&(a.date, a.id)));
        page.truncate(limit);
        Ok(Some(page))
    }

    async fn fetch_message_group(&self, channel_id: ChannelId, anchor_id: MessageId) -> Result<Vec<RawMessage>, QueryError> {
        self.check_channel(channel_id)?;
        let data = self.data();
        let grouped_id = data
            .messages
            .iter()
            .find(|m| m.channel_id == channel_id && m.id == anchor_id)
            .ok_or_else(|| QueryError::NotFound(format!("message {channel_id}/{anchor_id}")))?
            .grouped_id;
        let Some(grouped_id) = grouped_id else {
            return Ok(Vec::new());
        };
        Ok(data
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id && m.grouped_id == Some(grouped_id))
            .cloned()
            .collect())
    }

    async fn download_media(&self, channel_id: ChannelId, message_id: MessageId, size: SizeVariant) -> Result<Vec<u8>, QueryError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures().media.clone() {
            return Err(err);
        }
        let data = self.data();
        let has_media = data
            .messages
            .iter()
            .any(|m| m.channel_id == channel_id && m.id == message_id && m.media.is_some());
        if !has_media {
            return Err(QueryError::NotFound(format!("no media on {channel_id}/{message_id}")));
        }
        let identity = MediaIdentity::Message {
            channel_id,
            message_id,
            size,
        };
        media_bytes(&data, &identity)
    }

    async fn download_profile_photo(&self, peer_id: i64, size: SizeVariant) -> Result<Vec<u8>, QueryError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures().media.clone() {
            return Err(err);
        }
        let data = self.data();
        if !data.channels.iter().any(|c| c.id == peer_id && c.has_photo) {
            return Err(QueryError::NotFound(format!("no photo for {peer_id}")));
        }
        media_bytes(&data, &MediaIdentity::Profile { peer_id, size })
    }

    async fn fetch_comments(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        request: FetchComments,
    ) -> Result<RawCommentPage, QueryError> {
        let mut data = self.data();
        let thread = thread_mut(&mut data, channel_id, message_id)?;
        let mut comments: Vec<RawComment> = thread
            .comments
            .iter()
            .filter(|c| request.offset_id.is_none_or(|offset| c.id < offset))
            .filter(|c| {
                request
                    .reply_to
                    .is_none_or(|ancestor| descends_from(&thread.comments, c.id, ancestor))
            })
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.id.cmp(&a.id));
        comments.truncate(request.limit);
        Ok(RawCommentPage {
            total_count: thread.comments.len() as u32,
            comments,
            discussion_chat_id: thread.discussion_chat_id,
            root_message_id: thread.root_message_id,
        })
    }

    async fn send_comment(&self, request: SendComment) -> Result<RawComment, QueryError> {
        if let Some(err) = self.failures().next_send.take() {
            return Err(err);
        }
        let (comment, echo_live) = {
            let mut data = self.data();
            let me = data.me.clone();
            let echo_key = data.echo_client_key;
            let echo_live = data.echo_live;
            let thread = thread_mut(&mut data, request.channel_id, request.message_id)?;
            let id = thread.comments.iter().map(|c| c.id).max().unwrap_or(0) + 1;
            let comment = RawComment {
                id,
                date: Utc::now().timestamp(),
                edit_date: None,
                message: request.text.clone(),
                entities: Vec::new(),
                from_id: me.id,
                from_name: Some(me.name),
                reply_to_msg_id: request.reply_to.or(thread.root_message_id),
                media: None,
                reactions: Vec::new(),
                client_key: echo_key.then_some(request.client_key),
            };
            thread.comments.push(comment.clone());
            (comment, echo_live)
        };
        if echo_live {
            self.emit_event(LiveEvent::NewComment {
                channel_id: request.channel_id,
                message_id: request.message_id,
                comment: comment.clone(),
            });
        }
        Ok(comment)
    }

    async fn send_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: Option<String>,
    ) -> Result<Vec<RawReactionCount>, QueryError> {
        if let Some(err) = self.failures().reactions.clone() {
            return Err(err);
        }
        let mut data = self.data();
        let message = data
            .messages
            .iter_mut()
            .find(|m| m.channel_id == channel_id && m.id == message_id)
            .ok_or_else(|| QueryError::NotFound(format!("message {channel_id}/{message_id}")))?;

        for reaction in message.reactions.iter_mut() {
            if reaction.chosen_order.take().is_some() {
                reaction.count = reaction.count.saturating_sub(1);
            }
        }
        if let Some(emoji) = emoji {
            match message.reactions.iter_mut().find(|r| r.reaction == emoji) {
                Some(reaction) => {
                    reaction.count += 1;
                    reaction.chosen_order = Some(0);
                }
                None => message.reactions.push(RawReactionCount {
                    reaction: emoji,
                    count: 1,
                    chosen_order: Some(0),
                }),
            }
        }
        message.reactions.retain(|r| r.count > 0);
        Ok(message.reactions.clone())
    }

    async fn subscribe(&self) -> Result<LiveSubscription, QueryError> {
        let (tx, rx) = mpsc::channel(LIVE_BUFFER);
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        let slot = Arc::clone(&self.live);
        let handle = UnsubscribeHandle::new(move || {
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        });
        Ok(LiveSubscription { events: rx, handle })
    }
}

fn media_bytes(data: &Fixture, identity: &MediaIdentity) -> Result<Vec<u8>, QueryError> {
    match data.media.get(&identity.storage_key()) {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| QueryError::Unknown(format!("bad fixture media for {identity}: {e}"))),
        None => Ok(identity.storage_key().into_bytes()),
    }
}
