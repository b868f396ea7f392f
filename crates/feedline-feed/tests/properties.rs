//! Property tests for album aggregation and comment tree edits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::DateTime;
use proptest::prelude::*;

use feedline_feed::comments::{add_reply, count_comments, find_by_id, flatten, remove_by_ids};
use feedline_feed::types::{Author, Comment, Post, PostKey, TimelineItem};
use feedline_feed::aggregate;

fn post(channel_id: i64, id: i64, secs: i64, grouped_id: Option<i64>) -> Post {
    Post {
        id,
        channel_id,
        date: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        edit_date: None,
        text: String::new(),
        entities: vec![],
        media: None,
        grouped_id,
        views: None,
        replies: None,
        reactions: vec![],
    }
}

fn arb_posts() -> impl Strategy<Value = Vec<Post>> {
    prop::collection::vec(
        (1i64..4, 1i64..40, 0i64..60, prop::option::of(1i64..5)),
        0..40,
    )
    .prop_map(|raw| {
        // One date and album per identity, as the server would report.
        let mut by_key: HashMap<(i64, i64), Post> = HashMap::new();
        for (channel_id, id, secs, grouped_id) in raw {
            by_key
                .entry((channel_id, id))
                .or_insert_with(|| post(channel_id, id, secs, grouped_id));
        }
        let mut posts: Vec<Post> = by_key.into_values().collect();
        posts.sort_by_key(|p| (p.channel_id, p.id));
        posts
    })
}

fn comment(id: i64) -> Comment {
    Comment {
        id,
        text: format!("comment {id}"),
        entities: vec![],
        author: Author {
            id: 7,
            name: "seven".to_string(),
        },
        date: DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap_or_default(),
        edit_date: None,
        reply_to_id: None,
        reply_to_author: None,
        replies: vec![],
        media: None,
        reactions: vec![],
        client_key: None,
        pending: false,
    }
}

/// A tree built by attaching comment `i` under a previously added comment,
/// or as a root.
fn arb_tree() -> impl Strategy<Value = Vec<Arc<Comment>>> {
    prop::collection::vec(prop::option::of(any::<prop::sample::Index>()), 0..30).prop_map(|parents| {
        let mut roots = Vec::new();
        for (i, parent) in parents.into_iter().enumerate() {
            let id = i as i64 + 1;
            let parent_id = match parent {
                Some(index) if id > 1 => Some(index.index(id as usize - 1) as i64 + 1),
                _ => None,
            };
            roots = add_reply(&roots, parent_id, comment(id));
        }
        roots
    })
}

fn descendant_ids(node: &Comment, out: &mut HashSet<i64>) {
    for reply in &node.replies {
        out.insert(reply.id);
        descendant_ids(reply, out);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    /// Every album lands in exactly one item and every post appears once.
    #[test]
    fn groups_are_whole_and_unique(posts in arb_posts()) {
        let items = aggregate(&posts);

        let rendered: Vec<PostKey> = items.iter().flat_map(|i| i.posts()).map(Post::key).collect();
        let unique: HashSet<PostKey> = rendered.iter().copied().collect();
        prop_assert_eq!(unique.len(), rendered.len());
        prop_assert_eq!(unique.len(), posts.len());

        let mut owner: HashMap<(i64, i64), usize> = HashMap::new();
        for (index, item) in items.iter().enumerate() {
            for p in item.posts() {
                if let Some(g) = p.grouped_id {
                    let slot = *owner.entry((p.channel_id, g)).or_insert(index);
                    prop_assert_eq!(slot, index);
                }
            }
            if let TimelineItem::Group { posts: members, .. } = item {
                prop_assert!(members.len() > 1);
                prop_assert!(members.windows(2).all(|w| w[0].id < w[1].id));
            }
        }
    }

    /// Items are in feed order by their newest member.
    #[test]
    fn items_are_newest_first(posts in arb_posts()) {
        let items = aggregate(&posts);
        let anchors: Vec<_> = items
            .iter()
            .filter_map(|i| i.anchor())
            .map(Post::feed_position)
            .collect();
        prop_assert!(anchors.windows(2).all(|w| w[0] > w[1]));
    }

    /// Aggregating the flattened output again changes nothing.
    #[test]
    fn aggregation_is_idempotent(posts in arb_posts()) {
        let once = aggregate(&posts);
        let flat: Vec<Post> = once.iter().flat_map(|i| i.posts().to_vec()).collect();
        prop_assert_eq!(aggregate(&flat), once);
    }

    /// A reply added under any node can be found and grows the count by one.
    #[test]
    fn added_reply_is_findable(roots in arb_tree(), parent in any::<prop::sample::Index>()) {
        let before = count_comments(&roots);
        let parent_id = if before == 0 {
            None
        } else {
            Some(parent.index(before) as i64 + 1)
        };
        let roots_after = add_reply(&roots, parent_id, comment(1_000));
        prop_assert_eq!(count_comments(&roots_after), before + 1);

        let found = find_by_id(&roots_after, 1_000);
        prop_assert!(found.is_some());
        match parent_id {
            Some(pid) => {
                let parent_node = find_by_id(&roots_after, pid);
                prop_assert!(parent_node.is_some_and(|p| p.replies.iter().any(|r| r.id == 1_000)));
            }
            None => prop_assert_eq!(roots_after.first().map(|c| c.id), Some(1_000)),
        }
        // The input tree is untouched.
        prop_assert_eq!(count_comments(&roots), before);
    }

    /// Stripping a node counts only that node and leaves its replies
    /// unreachable.
    #[test]
    fn removal_counts_the_target_only(roots in arb_tree(), target in any::<prop::sample::Index>()) {
        let before = count_comments(&roots);
        prop_assume!(before > 0);
        let target_id = target.index(before) as i64 + 1;
        let node = find_by_id(&roots, target_id);
        prop_assert!(node.is_some());

        let mut unreachable = HashSet::from([target_id]);
        if let Some(node) = node {
            descendant_ids(&node, &mut unreachable);
        }
        let (after, removed) = remove_by_ids(&roots, &HashSet::from([target_id]));
        prop_assert_eq!(removed, 1);
        prop_assert_eq!(count_comments(&after), before - unreachable.len());

        let remaining: HashSet<i64> = flatten(&after).iter().map(|c| c.id).collect();
        prop_assert!(remaining.is_disjoint(&unreachable));
    }
}
