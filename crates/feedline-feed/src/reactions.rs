//! Optimistic reaction toggling on timeline posts.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use feedline_cache::{Mutation, QueryError, QueryKey};
use tracing::info;

use crate::cached::CachedData;
use crate::error::FeedError;
use crate::normalize::normalize_reactions;
use crate::raw::RawReactionCount;
use crate::remote::RemoteClient;
use crate::timeline::TimelineEngine;
use crate::types::{PostKey, Reaction};

/// Flip `emoji` in `reactions`. At most one reaction stays chosen.
///
/// Returns the reaction the user ends up with.
pub fn toggle(reactions: &mut Vec<Reaction>, emoji: &str) -> Option<String> {
    let was_chosen = reactions.iter().any(|r| r.emoji == emoji && r.chosen);
    for reaction in reactions.iter_mut().filter(|r| r.chosen) {
        reaction.chosen = false;
        reaction.count = reaction.count.saturating_sub(1);
    }
    if !was_chosen {
        match reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => {
                reaction.chosen = true;
                reaction.count += 1;
            }
            None => reactions.push(Reaction {
                emoji: emoji.to_string(),
                count: 1,
                chosen: true,
            }),
        }
    }
    reactions.retain(|r| r.count > 0);
    (!was_chosen).then(|| emoji.to_string())
}

struct ReactionToggle {
    key: QueryKey,
    post: PostKey,
    emoji: String,
    /// What `apply` decided to send; `None` until it ran.
    target: Mutex<Option<Option<String>>>,
    remote: Arc<dyn RemoteClient>,
}

#[async_trait]
impl Mutation<CachedData> for ReactionToggle {
    type Output = Vec<RawReactionCount>;

    fn keys(&self) -> Vec<QueryKey> {
        vec![self.key.clone()]
    }

    fn apply(&self, _key: &QueryKey, value: &mut CachedData) {
        let Some(post) = value.as_timeline_mut().and_then(|t| t.post_mut(self.post)) else {
            return;
        };
        let target = toggle(&mut post.reactions, &self.emoji);
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
    }

    async fn execute(&self) -> Result<Self::Output, QueryError> {
        let target = self.target.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(target) = target else {
            return Err(QueryError::NotFound(format!(
                "post {}/{} is not in the feed",
                self.post.channel_id, self.post.id
            )));
        };
        self.remote
            .send_reaction(self.post.channel_id, self.post.id, target)
            .await
    }

    fn confirm(&self, _key: &QueryKey, value: &mut CachedData, output: &Self::Output) {
        if let Some(post) = value.as_timeline_mut().and_then(|t| t.post_mut(self.post)) {
            post.reactions = normalize_reactions(output);
        }
    }
}

impl TimelineEngine {
    /// Toggle the current user's `emoji` reaction on a post in the feed.
    ///
    /// The change shows immediately. On failure the post's reactions are
    /// restored exactly and the error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_reaction(&self, post: PostKey, emoji: &str) -> Result<Vec<Reaction>, FeedError> {
        let key = self.current_key().ok_or(FeedError::TimelineNotLoaded)?;
        let mutation = ReactionToggle {
            key: key.clone(),
            post,
            emoji: emoji.to_string(),
            target: Mutex::new(None),
            remote: self.remote().clone(),
        };
        let counts = self.cache.mutate(&mutation, self.config.retry).await?;
        info!(channel_id = post.channel_id, id = post.id, "reaction confirmed");
        Ok(self
            .cache
            .get_data(&key)
            .and_then(CachedData::into_timeline)
            .and_then(|t| t.post(post).map(|p| p.reactions.clone()))
            .unwrap_or_else(|| normalize_reactions(&counts)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reaction(emoji: &str, count: u32, chosen: bool) -> Reaction {
        Reaction {
            emoji: emoji.to_string(),
            count,
            chosen,
        }
    }

    #[test]
    fn test_toggle_on_adds_reaction() {
        let mut reactions = vec![reaction("👍", 2, false)];
        assert_eq!(toggle(&mut reactions, "🔥"), Some("🔥".to_string()));
        assert_eq!(reactions, vec![reaction("👍", 2, false), reaction("🔥", 1, true)]);
    }

    #[test]
    fn test_toggle_off_drops_empty_reaction() {
        let mut reactions = vec![reaction("👍", 1, true), reaction("🔥", 3, false)];
        assert_eq!(toggle(&mut reactions, "👍"), None);
        assert_eq!(reactions, vec![reaction("🔥", 3, false)]);
    }

    #[test]
    fn test_toggle_switches_choice() {
        let mut reactions = vec![reaction("👍", 4, true), reaction("🔥", 3, false)];
        assert_eq!(toggle(&mut reactions, "🔥"), Some("🔥".to_string()));
        assert_eq!(reactions, vec![reaction("👍", 3, false), reaction("🔥", 4, true)]);
    }
}
