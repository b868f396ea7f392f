//! Query keys used by the feed engines.
//!
//! Keys carry stable, small parameters only. The timeline is keyed by the
//! number of tracked channels rather than the channel list itself.

use feedline_cache::{QueryKey, query_key};

use crate::types::{ChannelId, MessageId};

pub const TIMELINE: &str = "timeline";
pub const COMMENTS: &str = "comments";
pub const CHANNELS: &str = "channels";
pub const MEDIA: &str = "media";

pub fn timeline(channel_count: usize) -> QueryKey {
    query_key![TIMELINE, "feed", channel_count]
}

pub fn timeline_prefix() -> QueryKey {
    QueryKey::new(TIMELINE)
}

pub fn comments_thread(channel_id: ChannelId, message_id: MessageId) -> QueryKey {
    query_key![COMMENTS, "thread", channel_id, message_id]
}

pub fn comments_prefix() -> QueryKey {
    QueryKey::new(COMMENTS)
}

pub fn channels() -> QueryKey {
    query_key![CHANNELS, "list"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(timeline(3).to_string(), "timeline/feed/3");
        assert_eq!(comments_thread(-100, 7).to_string(), "comments/thread/-100/7");
        assert_eq!(channels().to_string(), "channels/list");
        assert!(comments_thread(1, 2).starts_with(&comments_prefix()));
        assert!(timeline(0).starts_with(&timeline_prefix()));
    }
}
