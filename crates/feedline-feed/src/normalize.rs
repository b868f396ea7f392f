//! Mapping raw remote messages into [`Post`] and [`Comment`].

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::raw::{RawComment, RawEntity, RawMedia, RawMessage, RawReactionCount};
use crate::types::{
    Author, Comment, EntityKind, MediaKind, MediaRef, MessageId, Post, Reaction, TextEntity,
    TextSegment,
};

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn normalize_post(raw: &RawMessage) -> Post {
    Post {
        id: raw.id,
        channel_id: raw.channel_id,
        date: from_unix(raw.date),
        edit_date: raw.edit_date.map(from_unix),
        text: raw.message.clone(),
        entities: normalize_entities(&raw.message, &raw.entities),
        media: raw.media.as_ref().map(normalize_media),
        grouped_id: raw.grouped_id,
        views: raw.views,
        replies: raw.replies.as_ref().map(|r| r.replies),
        reactions: normalize_reactions(&raw.reactions),
    }
}

/// Normalize a discussion comment. Replies to `root_message_id` (the
/// discussion copy of the post) become root comments.
pub fn normalize_comment(raw: &RawComment, root_message_id: Option<MessageId>) -> Comment {
    let reply_to_id = match raw.reply_to_msg_id {
        Some(id) if Some(id) == root_message_id => None,
        other => other,
    };
    Comment {
        id: raw.id,
        text: raw.message.clone(),
        entities: normalize_entities(&raw.message, &raw.entities),
        author: Author {
            id: raw.from_id,
            name: raw
                .from_name
                .clone()
                .unwrap_or_else(|| format!("user {}", raw.from_id)),
        },
        date: from_unix(raw.date),
        edit_date: raw.edit_date.map(from_unix),
        reply_to_id,
        reply_to_author: None,
        replies: Vec::new(),
        media: raw.media.as_ref().map(normalize_media),
        reactions: normalize_reactions(&raw.reactions),
        client_key: raw.client_key,
        pending: false,
    }
}

pub fn normalize_media(raw: &RawMedia) -> MediaRef {
    let kind = match raw.kind.as_str() {
        "photo" => MediaKind::Photo,
        "video" => MediaKind::Video,
        "animation" | "gif" => MediaKind::Animation,
        "audio" => MediaKind::Audio,
        "voice" => MediaKind::Voice,
        "document" => MediaKind::Document,
        "sticker" => MediaKind::Sticker,
        "webpage" => MediaKind::WebPage,
        "poll" => MediaKind::Poll,
        _ => MediaKind::Other,
    };
    MediaRef {
        kind,
        mime_type: raw.mime_type.clone(),
        width: raw.width,
        height: raw.height,
        duration_secs: raw.duration,
        file_name: raw.file_name.clone(),
        size: raw.size,
        has_thumb: raw.has_thumb,
    }
}

pub fn normalize_reactions(raw: &[RawReactionCount]) -> Vec<Reaction> {
    raw.iter()
        .filter(|r| r.count > 0)
        .map(|r| Reaction {
            emoji: r.reaction.clone(),
            count: r.count,
            chosen: r.chosen_order.is_some(),
        })
        .collect()
}

fn entity_kind(raw: &RawEntity) -> Option<EntityKind> {
    let kind = match raw.kind.as_str() {
        "bold" => EntityKind::Bold,
        "italic" => EntityKind::Italic,
        "underline" => EntityKind::Underline,
        "strike" | "strikethrough" => EntityKind::Strike,
        "spoiler" => EntityKind::Spoiler,
        "code" => EntityKind::Code,
        "pre" => EntityKind::Pre {
            language: raw.language.clone().filter(|l| !l.is_empty()),
        },
        "blockquote" => EntityKind::Blockquote,
        "url" => EntityKind::Url,
        "text_url" => EntityKind::TextUrl {
            url: raw.url.clone()?,
        },
        "mention" => EntityKind::Mention,
        "mention_name" => EntityKind::MentionName {
            user_id: raw.user_id?,
        },
        "hashtag" => EntityKind::Hashtag,
        "cashtag" => EntityKind::Cashtag,
        "bot_command" => EntityKind::BotCommand,
        "email" => EntityKind::Email,
        "phone" => EntityKind::Phone,
        "custom_emoji" => EntityKind::CustomEmoji {
            document_id: raw.document_id?,
        },
        other => {
            trace!(kind = other, "skipping unsupported entity");
            return None;
        }
    };
    Some(kind)
}

/// UTF-16 offset to byte offset table for one string.
struct Utf16Index {
    /// `(utf16_offset, byte_offset)` at every char boundary, plus the end.
    boundaries: Vec<(usize, usize)>,
}

impl Utf16Index {
    fn new(text: &str) -> Self {
        let mut boundaries = Vec::with_capacity(text.len() + 1);
        let mut units = 0;
        for (byte, ch) in text.char_indices() {
            boundaries.push((units, byte));
            units += ch.len_utf16();
        }
        boundaries.push((units, text.len()));
        Self { boundaries }
    }

    fn len_utf16(&self) -> usize {
        self.boundaries.last().map_or(0, |(u, _)| *u)
    }

    /// Byte offset of the first char boundary at or after `units`.
    fn byte_at(&self, units: usize) -> usize {
        let i = self.boundaries.partition_point(|(u, _)| *u < units);
        self.boundaries
            .get(i)
            .or(self.boundaries.last())
            .map_or(0, |(_, b)| *b)
    }
}

/// Convert UTF-16 entity ranges into byte ranges, dropping unknown or empty ones.
pub fn normalize_entities(text: &str, raw: &[RawEntity]) -> Vec<TextEntity> {
    if raw.is_empty() {
        return Vec::new();
    }
    let index = Utf16Index::new(text);
    let total = index.len_utf16();
    let mut entities: Vec<TextEntity> = raw
        .iter()
        .filter_map(|e| {
            let kind = entity_kind(e)?;
            let start = index.byte_at(e.offset.min(total));
            let end = index.byte_at(e.offset.saturating_add(e.length).min(total));
            (start < end).then_some(TextEntity { start, end, kind })
        })
        .collect();
    entities.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    entities
}

/// Split `text` at every entity boundary.
///
/// Each segment lists the entities covering it, outermost first. Empty text
/// yields no segments.
pub fn segment_text(text: &str, entities: &[TextEntity]) -> Vec<TextSegment> {
    let mut cuts: Vec<usize> = Vec::with_capacity(entities.len() * 2 + 2);
    cuts.push(0);
    cuts.push(text.len());
    for e in entities {
        if e.end <= text.len() && text.is_char_boundary(e.start) && text.is_char_boundary(e.end) {
            cuts.push(e.start);
            cuts.push(e.end);
        }
    }
    cuts.sort_unstable();
    cuts.dedup();

    cuts.windows(2)
        .filter_map(|w| {
            let (a, b) = (w[0], w[1]);
            let piece = text.get(a..b)?;
            let styles = entities
                .iter()
                .filter(|e| e.start <= a && e.end >= b)
                .map(|e| e.kind.clone())
                .collect();
            Some(TextSegment {
                text: piece.to_string(),
                styles,
            })
        })
        .collect()
}
