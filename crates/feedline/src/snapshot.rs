//! Snapshot inspection and removal.

use std::path::Path;
use std::sync::Arc;

use feedline_cache::media::MEDIA_KEY_PREFIX;
use feedline_cache::{FileStore, KvStore, Persister, SystemClock};
use feedline_feed::{CachedData, FeedConfig};
use miette::Result;
use tracing::info;

async fn open(data_dir: &Path, config: FeedConfig) -> Result<(Arc<FileStore>, Persister<CachedData>)> {
    let store = Arc::new(
        FileStore::open(data_dir)
            .await
            .map_err(|e| miette::miette!("failed to open data dir {}: {}", data_dir.display(), e))?,
    );
    let persister = Persister::new(store.clone(), config.cache, Arc::new(SystemClock));
    Ok((store, persister))
}

pub async fn show(data_dir: &Path, config: FeedConfig) -> Result<()> {
    let (store, persister) = open(data_dir, config).await?;
    let version = store
        .get(&persister.config().version_key())
        .await
        .map_err(|e| miette::miette!("failed to read version marker: {}", e))?
        .map(|v| String::from_utf8_lossy(&v).into_owned());
    println!("version: {}", version.as_deref().unwrap_or("(none)"));

    let snapshot = persister
        .read()
        .await
        .map_err(|e| miette::miette!("failed to read snapshot: {}", e))?;
    match snapshot {
        Some(snapshot) => {
            println!("timestamp: {}", snapshot.timestamp.to_rfc3339());
            for query in &snapshot.client_state.queries {
                println!("  {}  (fetched {})", query.key, query.fetched_at.to_rfc3339());
            }
        }
        None => println!("no snapshot"),
    }

    let media = store
        .keys_with_prefix(MEDIA_KEY_PREFIX)
        .await
        .map_err(|e| miette::miette!("failed to list media: {}", e))?;
    println!("media blobs: {}", media.len());
    Ok(())
}

pub async fn clear(data_dir: &Path, config: FeedConfig) -> Result<()> {
    let (store, persister) = open(data_dir, config).await?;
    persister
        .reset()
        .await
        .map_err(|e| miette::miette!("failed to delete snapshot: {}", e))?;

    let media = store
        .keys_with_prefix(MEDIA_KEY_PREFIX)
        .await
        .map_err(|e| miette::miette!("failed to list media: {}", e))?;
    for key in &media {
        store
            .delete(key)
            .await
            .map_err(|e| miette::miette!("failed to delete {}: {}", key, e))?;
    }
    info!(media = media.len(), "cleared persisted cache");
    println!("cleared snapshot and {} media blobs", media.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_removes_snapshot_marker_and_media() {
        let dir = tempfile::tempdir().unwrap();
        let config = FeedConfig::default();
        let (store, persister) = open(dir.path(), config.clone()).await.unwrap();
        store.set(&config.cache.snapshot_key, b"{}".to_vec()).await.unwrap();
        store.set(&persister.config().version_key(), b"1".to_vec()).await.unwrap();
        store.set("media:msg:1:1:thumb", b"png".to_vec()).await.unwrap();
        store.set("unrelated", b"x".to_vec()).await.unwrap();

        clear(dir.path(), config.clone()).await.unwrap();

        assert!(store.get(&config.cache.snapshot_key).await.unwrap().is_none());
        assert!(store.get(&persister.config().version_key()).await.unwrap().is_none());
        assert!(store.get("media:msg:1:1:thumb").await.unwrap().is_none());
        assert!(store.get("unrelated").await.unwrap().is_some());
    }
}
