//! Feed entities: posts, timeline items, comments and channels.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use feedline_cache::codec;
use feedline_cache::{MediaIdentity, SizeVariant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ChannelId = i64;
pub type MessageId = i64;

/// Identity of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PostKey {
    pub channel_id: ChannelId,
    pub id: MessageId,
}

impl PostKey {
    pub fn new(channel_id: ChannelId, id: MessageId) -> Self {
        Self { channel_id, id }
    }
}

/// Rich-text styling attached to a byte range of the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strike,
    Spoiler,
    Code,
    Pre { language: Option<String> },
    Blockquote,
    Url,
    TextUrl { url: String },
    Mention,
    MentionName { user_id: i64 },
    Hashtag,
    Cashtag,
    BotCommand,
    Email,
    Phone,
    CustomEmoji { document_id: i64 },
}

/// An entity over `text[start..end]`. Offsets are UTF-8 byte offsets on
/// character boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub start: usize,
    pub end: usize,
    pub kind: EntityKind,
}

/// A run of text with every entity that covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub styles: Vec<EntityKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
    Audio,
    Voice,
    Document,
    Sticker,
    WebPage,
    Poll,
    Other,
}

/// What a post carries besides text. Bytes are resolved through the media cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    pub has_thumb: bool,
}

impl MediaRef {
    /// Whether a downloadable payload exists for this media.
    pub fn is_downloadable(&self) -> bool {
        !matches!(self.kind, MediaKind::Poll | MediaKind::WebPage) || self.has_thumb
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: u32,
    /// Whether the current user picked this reaction.
    pub chosen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(with = "codec::timestamp")]
    pub date: DateTime<Utc>,
    #[serde(with = "codec::timestamp::option")]
    pub edit_date: Option<DateTime<Utc>>,
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub media: Option<MediaRef>,
    pub grouped_id: Option<i64>,
    pub views: Option<u64>,
    pub replies: Option<u32>,
    pub reactions: Vec<Reaction>,
}

impl Post {
    pub fn key(&self) -> PostKey {
        PostKey::new(self.channel_id, self.id)
    }

    /// Position in the feed.
    pub fn feed_position(&self) -> FeedCursor {
        FeedCursor {
            date: self.date,
            id: self.id,
            channel_id: self.channel_id,
        }
    }

    /// Media identity for downloading this post's media at `size`.
    pub fn media_identity(&self, size: SizeVariant) -> Option<MediaIdentity> {
        self.media.as_ref().filter(|m| m.is_downloadable())?;
        Some(MediaIdentity::Message {
            channel_id: self.channel_id,
            message_id: self.id,
            size,
        })
    }
}

/// Feed order: newest first, ties broken by descending id, then channel.
pub fn feed_order(a: &Post, b: &Post) -> Ordering {
    b.feed_position().cmp(&a.feed_position())
}

/// A position in the feed, ordered oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedCursor {
    #[serde(with = "codec::timestamp")]
    pub date: DateTime<Utc>,
    pub id: MessageId,
    pub channel_id: ChannelId,
}

/// One rendered unit of the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineItem {
    Single { post: Post },
    Group { posts: Vec<Post>, grouped_id: i64 },
}

impl TimelineItem {
    pub fn posts(&self) -> &[Post] {
        match self {
            TimelineItem::Single { post } => std::slice::from_ref(post),
            TimelineItem::Group { posts, .. } => posts,
        }
    }

    /// The post whose position the item takes in the feed.
    pub fn anchor(&self) -> Option<&Post> {
        self.posts().iter().max_by(|a, b| a.feed_position().cmp(&b.feed_position()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: MessageId,
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub author: Author,
    #[serde(with = "codec::timestamp")]
    pub date: DateTime<Utc>,
    #[serde(with = "codec::timestamp::option")]
    pub edit_date: Option<DateTime<Utc>>,
    pub reply_to_id: Option<MessageId>,
    pub reply_to_author: Option<String>,
    pub replies: Vec<Arc<Comment>>,
    pub media: Option<MediaRef>,
    pub reactions: Vec<Reaction>,
    /// Idempotency key of a locally submitted comment, echoed by the server.
    pub client_key: Option<Uuid>,
    /// Set while the comment only exists locally.
    pub pending: bool,
}

impl Comment {
    /// Number of comments in this subtree, excluding this one.
    pub fn descendant_count(&self) -> usize {
        self.replies
            .iter()
            .map(|r| 1 + r.descendant_count())
            .sum()
    }
}

/// The discussion attached to one post.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommentThread {
    pub total_count: u32,
    /// Root comments, newest first.
    pub comments: Vec<Arc<Comment>>,
    pub discussion_chat_id: Option<i64>,
    /// The discussion copy of the post; replies to it are root comments.
    #[serde(default)]
    pub root_message_id: Option<MessageId>,
    pub has_more: bool,
    /// Where the next older page starts.
    pub next_offset_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub title: String,
    pub username: Option<String>,
    pub has_photo: bool,
}

impl Channel {
    pub fn photo_identity(&self, size: SizeVariant) -> Option<MediaIdentity> {
        self.has_photo.then_some(MediaIdentity::Profile {
            peer_id: self.id,
            size,
        })
    }
}
