//! Media-group aggregation.
//!
//! Posts sharing an album identity within one channel collapse into a single
//! [`TimelineItem::Group`] placed at the position of its newest member.

use std::collections::{HashMap, HashSet};

use crate::types::{ChannelId, Post, PostKey, TimelineItem, feed_order};

/// Build timeline items from `posts` in feed order.
///
/// Duplicate posts (same channel and id) keep their first occurrence. Album
/// members are ordered by ascending id inside the group; a group with one
/// member becomes a single item.
pub fn aggregate(posts: &[Post]) -> Vec<TimelineItem> {
    let mut sorted: Vec<&Post> = posts.iter().collect();
    sorted.sort_by(|a, b| feed_order(a, b));

    let mut seen: HashSet<PostKey> = HashSet::with_capacity(sorted.len());
    let mut group_slots: HashMap<(ChannelId, i64), usize> = HashMap::new();
    let mut items: Vec<TimelineItem> = Vec::with_capacity(sorted.len());

    for post in sorted {
        if !seen.insert(post.key()) {
            continue;
        }
        let Some(grouped_id) = post.grouped_id else {
            items.push(TimelineItem::Single { post: post.clone() });
            continue;
        };
        match group_slots.get(&(post.channel_id, grouped_id)) {
            Some(&slot) => {
                if let TimelineItem::Group { posts, .. } = &mut items[slot] {
                    posts.push(post.clone());
                }
            }
            None => {
                group_slots.insert((post.channel_id, grouped_id), items.len());
                items.push(TimelineItem::Group {
                    posts: vec![post.clone()],
                    grouped_id,
                });
            }
        }
    }

    items
        .into_iter()
        .map(|item| match item {
            TimelineItem::Group { mut posts, grouped_id } => {
                if posts.len() == 1 {
                    TimelineItem::Single {
                        post: posts.remove(0),
                    }
                } else {
                    posts.sort_by_key(|p| p.id);
                    TimelineItem::Group { posts, grouped_id }
                }
            }
            single => single,
        })
        .collect()
}
