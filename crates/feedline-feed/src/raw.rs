//! Representations as delivered by the remote service.
//!
//! Dates are unix seconds and entity offsets count UTF-16 code units.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChannelId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    /// Entity type name, e.g. `bold` or `text_url`.
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMedia {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub has_thumb: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReactionCount {
    pub reaction: String,
    pub count: u32,
    /// Present when the current user chose this reaction.
    #[serde(default)]
    pub chosen_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReplies {
    pub replies: u32,
    #[serde(default)]
    pub channel_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub date: i64,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub media: Option<RawMedia>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    #[serde(default)]
    pub views: Option<u64>,
    #[serde(default)]
    pub replies: Option<RawReplies>,
    #[serde(default)]
    pub reactions: Vec<RawReactionCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawComment {
    pub id: MessageId,
    pub date: i64,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    pub from_id: i64,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub reply_to_msg_id: Option<MessageId>,
    #[serde(default)]
    pub media: Option<RawMedia>,
    #[serde(default)]
    pub reactions: Vec<RawReactionCount>,
    /// Echo of the idempotency key sent with the comment, if the server supports it.
    #[serde(default)]
    pub client_key: Option<Uuid>,
}

/// One page of a discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommentPage {
    pub total_count: u32,
    pub comments: Vec<RawComment>,
    #[serde(default)]
    pub discussion_chat_id: Option<i64>,
    /// The id of the discussion copy of the post; replies to it are root comments.
    #[serde(default)]
    pub root_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    Broadcast,
    Megagroup,
    Group,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDialog {
    pub id: i64,
    pub title: String,
    pub kind: DialogKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub has_photo: bool,
}
