//! The remote service collaborator.
//!
//! The wire protocol lives behind [`RemoteClient`]; the engines only see raw
//! representations and [`QueryError`]s.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use feedline_cache::{MediaIdentity, MediaSource, QueryError, SizeVariant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::live::LiveEnvelope;
use crate::raw::{RawComment, RawCommentPage, RawDialog, RawMessage, RawReactionCount};
use crate::types::{Author, ChannelId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchMessages {
    pub limit: usize,
    /// Only messages with a smaller id. `None` fetches the newest page.
    pub before_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchComments {
    pub limit: usize,
    /// Only comments with a smaller id.
    pub offset_id: Option<MessageId>,
    /// Restrict to the subtree under this comment.
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendComment {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub text: String,
    pub reply_to: Option<MessageId>,
    /// Idempotency key; servers that support it echo it on the created comment.
    pub client_key: Uuid,
}

/// Stops live delivery when called or dropped.
pub struct UnsubscribeHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl UnsubscribeHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for UnsubscribeHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// An open live-update stream.
#[derive(Debug)]
pub struct LiveSubscription {
    pub events: mpsc::Receiver<LiveEnvelope>,
    pub handle: UnsubscribeHandle,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self) -> Result<(), QueryError>;

    async fn current_user(&self) -> Result<Author, QueryError>;

    /// List dialogs, newest activity first, stopping after `max` entries.
    async fn iterate_dialogs(&self, max: usize) -> Result<Vec<RawDialog>, QueryError>;

    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        request: FetchMessages,
    ) -> Result<Vec<RawMessage>, QueryError>;

    /// A pre-merged newest page across `channels`, when the server offers one.
    async fn fetch_timeline(
        &self,
        _channels: &[ChannelId],
        _limit: usize,
    ) -> Result<Option<Vec<RawMessage>>, QueryError> {
        Ok(None)
    }

    /// Every member of the album containing `anchor_id`.
    async fn fetch_message_group(
        &self,
        channel_id: ChannelId,
        anchor_id: MessageId,
    ) -> Result<Vec<RawMessage>, QueryError>;

    async fn download_media(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        size: SizeVariant,
    ) -> Result<Vec<u8>, QueryError>;

    async fn download_profile_photo(
        &self,
        peer_id: i64,
        size: SizeVariant,
    ) -> Result<Vec<u8>, QueryError>;

    async fn fetch_comments(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        request: FetchComments,
    ) -> Result<RawCommentPage, QueryError>;

    async fn send_comment(&self, request: SendComment) -> Result<RawComment, QueryError>;

    /// Set (or clear, with `None`) the current user's reaction. Returns the
    /// post's reaction counts after the change.
    async fn send_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: Option<String>,
    ) -> Result<Vec<RawReactionCount>, QueryError>;

    async fn subscribe(&self) -> Result<LiveSubscription, QueryError>;
}

/// Adapts a [`RemoteClient`] into the media cache's download tier.
pub struct RemoteMediaSource(pub Arc<dyn RemoteClient>);

#[async_trait]
impl MediaSource for RemoteMediaSource {
    async fn download(&self, identity: &MediaIdentity) -> Result<Vec<u8>, QueryError> {
        match identity {
            MediaIdentity::Message {
                channel_id,
                message_id,
                size,
            } => self.0.download_media(*channel_id, *message_id, *size).await,
            MediaIdentity::Profile { peer_id, size } => {
                self.0.download_profile_photo(*peer_id, *size).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_unsubscribe_runs_once_on_drop() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = UnsubscribeHandle::new(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        drop(handle);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        UnsubscribeHandle::new(move || flag.store(true, Ordering::SeqCst)).unsubscribe();
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
