//! Plain-text rendering of feed pages.

use std::collections::HashMap;
use std::fmt::Write;

use feedline_feed::{Channel, ChannelId, FeedPage, Post, TimelineItem};

const PREVIEW_CHARS: usize = 60;

fn preview(post: &Post) -> String {
    let line = post.text.lines().next().unwrap_or_default();
    let mut text: String = line.chars().take(PREVIEW_CHARS).collect();
    if line.chars().count() > PREVIEW_CHARS {
        text.push('…');
    }
    if text.is_empty() {
        if let Some(media) = &post.media {
            text = format!("[{:?}]", media.kind).to_lowercase();
        }
    }
    text
}

pub fn feed(page: &FeedPage, channels: &[Channel]) -> String {
    let titles: HashMap<ChannelId, &str> = channels.iter().map(|c| (c.id, c.title.as_str())).collect();
    let title = |id: ChannelId| titles.get(&id).copied().unwrap_or("?").to_string();

    let mut out = String::new();
    for item in &page.items {
        let Some(anchor) = item.anchor() else {
            continue;
        };
        let when = anchor.date.format("%Y-%m-%d %H:%M");
        match item {
            TimelineItem::Single { post } => {
                let _ = writeln!(out, "{when}  {:<16} #{:<6} {}", title(post.channel_id), post.id, preview(post));
            }
            TimelineItem::Group { posts, .. } => {
                let caption = posts.iter().map(preview).find(|p| !p.is_empty()).unwrap_or_default();
                let _ = writeln!(
                    out,
                    "{when}  {:<16} #{:<6} album of {}: {}",
                    title(anchor.channel_id),
                    anchor.id,
                    posts.len(),
                    caption
                );
            }
        }
    }
    if page.items.is_empty() {
        out.push_str("(no posts)\n");
    }
    if !page.failed_channels.is_empty() {
        let failed: Vec<String> = page.failed_channels.iter().map(|id| title(*id)).collect();
        let _ = writeln!(out, "failed: {}", failed.join(", "));
    }
    if page.has_more {
        out.push_str("(more below)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn post(id: i64, secs: i64, text: &str, grouped_id: Option<i64>) -> Post {
        Post {
            id,
            channel_id: 1,
            date: DateTime::from_timestamp(secs, 0).unwrap(),
            edit_date: None,
            text: text.to_string(),
            entities: vec![],
            media: None,
            grouped_id,
            views: None,
            replies: None,
            reactions: vec![],
        }
    }

    #[test]
    fn test_feed_lists_singles_and_albums() {
        let page = FeedPage {
            items: vec![
                TimelineItem::Group {
                    posts: vec![post(2, 20, "", Some(9)), post(3, 20, "caption\nmore", Some(9))],
                    grouped_id: 9,
                },
                TimelineItem::Single {
                    post: post(1, 10, "hello", None),
                },
            ],
            has_more: true,
            cursor: None,
            pending_count: 0,
            failed_channels: vec![],
        };
        let channels = vec![Channel {
            id: 1,
            title: "news".to_string(),
            username: None,
            has_photo: false,
        }];
        let text = feed(&page, &channels);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("album of 2: caption"));
        assert!(lines[1].ends_with("hello"));
        assert_eq!(lines[2], "(more below)");
    }
}
