//! The list of broadcast channels the user follows.

use std::sync::Arc;

use feedline_cache::{QueryCache, QueryOptions, fetcher_fn};
use tracing::{debug, info};

use crate::cached::CachedData;
use crate::error::FeedError;
use crate::keys;
use crate::options::{DirectoryConfig, QueryPresets};
use crate::raw::{DialogKind, RawDialog};
use crate::remote::RemoteClient;
use crate::types::Channel;

fn to_channel(dialog: RawDialog) -> Option<Channel> {
    (dialog.kind == DialogKind::Broadcast).then(|| Channel {
        id: dialog.id,
        title: dialog.title,
        username: dialog.username,
        has_photo: dialog.has_photo,
    })
}

pub struct ChannelDirectory {
    cache: Arc<QueryCache<CachedData>>,
    remote: Arc<dyn RemoteClient>,
    config: DirectoryConfig,
}

impl ChannelDirectory {
    pub fn new(cache: Arc<QueryCache<CachedData>>, remote: Arc<dyn RemoteClient>, config: DirectoryConfig) -> Self {
        Self { cache, remote, config }
    }

    /// Broadcast channels among the user's dialogs, in dialog order.
    #[tracing::instrument(skip(self))]
    pub async fn channels(&self) -> Result<Vec<Channel>, FeedError> {
        let remote = self.remote.clone();
        let max = self.config.max_dialogs;
        let fetcher = fetcher_fn(move || {
            let remote = remote.clone();
            async move {
                let dialogs = remote.iterate_dialogs(max).await?;
                let seen = dialogs.len();
                let channels: Vec<Channel> = dialogs.into_iter().filter_map(to_channel).collect();
                debug!(dialogs = seen, channels = channels.len(), "listed dialogs");
                Ok(CachedData::Channels(channels))
            }
        });

        let key = keys::channels();
        let state = self.cache.query(&key, fetcher, QueryOptions::channels()).await;
        match (state.data.and_then(CachedData::into_channels), state.error) {
            (Some(channels), _) => {
                info!(count = channels.len(), "channels loaded");
                Ok(channels)
            }
            (None, Some(err)) => Err(err.into()),
            (None, None) => Ok(Vec::new()),
        }
    }
}
