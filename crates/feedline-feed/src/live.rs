//! Live update reconciliation.
//!
//! Envelopes carry a sequence number assigned by the subscription. They are
//! applied one at a time, in receipt order, by a single task; anything at or
//! below the last applied sequence is a redelivery and is skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::comments::CommentEngine;
use crate::normalize::normalize_post;
use crate::raw::{RawComment, RawMessage};
use crate::timeline::TimelineEngine;
use crate::types::{ChannelId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    NewMessage {
        message: RawMessage,
    },
    EditMessage {
        message: RawMessage,
    },
    DeleteMessages {
        channel_id: ChannelId,
        ids: Vec<MessageId>,
    },
    NewComment {
        channel_id: ChannelId,
        message_id: MessageId,
        comment: RawComment,
    },
    EditComment {
        channel_id: ChannelId,
        message_id: MessageId,
        comment: RawComment,
    },
    DeleteComments {
        channel_id: ChannelId,
        message_id: MessageId,
        ids: Vec<MessageId>,
    },
}

impl LiveEvent {
    fn kind(&self) -> &'static str {
        match self {
            LiveEvent::NewMessage { .. } => "new_message",
            LiveEvent::EditMessage { .. } => "edit_message",
            LiveEvent::DeleteMessages { .. } => "delete_messages",
            LiveEvent::NewComment { .. } => "new_comment",
            LiveEvent::EditComment { .. } => "edit_comment",
            LiveEvent::DeleteComments { .. } => "delete_comments",
        }
    }
}

/// An event with its position in the subscription. Sequences start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEnvelope {
    pub seq: u64,
    pub event: LiveEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Already applied.
    Duplicate,
    /// The target is not in any loaded feed or thread.
    Untracked,
    /// An edit or delete for something that was never delivered.
    UnknownTarget,
    /// The reconciler was torn down.
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Held back until the reader returns to the top of the feed.
    Pending,
    Ignored(IgnoreReason),
}

pub struct LiveReconciler {
    timeline: Arc<TimelineEngine>,
    comments: Arc<CommentEngine>,
    last_seq: AtomicU64,
    torn_down: AtomicBool,
    processed: watch::Sender<u64>,
}

impl LiveReconciler {
    pub fn new(timeline: Arc<TimelineEngine>, comments: Arc<CommentEngine>) -> Self {
        Self {
            timeline,
            comments,
            last_seq: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            processed: watch::channel(0).0,
        }
    }

    /// Highest sequence number handled so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    /// Follows the highest handled sequence number.
    pub fn processed(&self) -> watch::Receiver<u64> {
        self.processed.subscribe()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Stop applying events. Takes effect before the next event is looked at.
    pub fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            info!(last_seq = self.last_seq(), "live updates torn down");
        }
    }

    /// Apply one envelope.
    pub async fn apply(&self, envelope: LiveEnvelope) -> ApplyOutcome {
        if self.is_torn_down() {
            return ApplyOutcome::Ignored(IgnoreReason::TornDown);
        }
        let seq = envelope.seq;
        let previous = self.last_seq.fetch_max(seq, Ordering::SeqCst);
        if seq <= previous {
            trace!(seq, previous, "skipping redelivered event");
            return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
        }

        let kind = envelope.event.kind();
        let outcome = match envelope.event {
            LiveEvent::NewMessage { message } => self.timeline.apply_new(normalize_post(&message)).await,
            LiveEvent::EditMessage { message } => self.timeline.apply_edit(normalize_post(&message)).await,
            LiveEvent::DeleteMessages { channel_id, ids } => {
                self.timeline.apply_delete(channel_id, &ids).await
            }
            LiveEvent::NewComment {
                channel_id,
                message_id,
                comment,
            } => self.comments.apply_new(channel_id, message_id, &comment).await,
            LiveEvent::EditComment {
                channel_id,
                message_id,
                comment,
            } => self.comments.apply_edit(channel_id, message_id, &comment).await,
            LiveEvent::DeleteComments {
                channel_id,
                message_id,
                ids,
            } => self.comments.apply_delete(channel_id, message_id, &ids).await,
        };

        match outcome {
            ApplyOutcome::Ignored(IgnoreReason::UnknownTarget) => {
                warn!(seq, kind, "event targets nothing that was delivered, dropping it")
            }
            outcome => debug!(seq, kind, outcome = ?outcome, "applied live event"),
        }
        self.processed.send_replace(seq);
        outcome
    }

    /// Drain `events` on one task until the stream ends, `shutdown` fires or
    /// the reconciler is torn down.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<LiveEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("live task shutting down");
                            break;
                        }
                    }
                    envelope = events.recv() => {
                        let Some(envelope) = envelope else {
                            debug!("live stream closed");
                            break;
                        };
                        if this.is_torn_down() {
                            break;
                        }
                        this.apply(envelope).await;
                    }
                }
            }
        })
    }
}
