//! Offline replay of a fixture through the full engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use feedline_cache::FileStore;
use feedline_feed::{FeedConfig, FeedContext, FixtureRemote};
use miette::Result;
use tracing::{info, warn};

use crate::render;

const LIVE_WAIT: Duration = Duration::from_secs(5);

pub async fn run(data_dir: &Path, config: FeedConfig, fixture: &Path, scrolled_away: bool) -> Result<()> {
    let remote = Arc::new(
        FixtureRemote::load(fixture)
            .await
            .map_err(|e| miette::miette!("failed to load fixture {}: {}", fixture.display(), e))?,
    );
    let store = Arc::new(
        FileStore::open(data_dir)
            .await
            .map_err(|e| miette::miette!("failed to open data dir {}: {}", data_dir.display(), e))?,
    );
    let ctx = FeedContext::init(config, store, remote.clone())
        .await
        .map_err(|e| miette::miette!("failed to start: {}", e))?;
    info!(restored = ?ctx.restored(), "context ready");

    let channels = ctx
        .directory()
        .channels()
        .await
        .map_err(|e| miette::miette!("failed to list channels: {}", e))?;
    let ids: Vec<_> = channels.iter().map(|c| c.id).collect();

    let timeline = ctx.timeline();
    timeline.set_scrolled_away(scrolled_away);
    let page = timeline
        .load(&ids)
        .await
        .map_err(|e| miette::miette!("failed to load feed: {}", e))?;
    println!("== feed ({} channels)", ids.len());
    print!("{}", render::feed(&page, &channels));

    let mut processed = ctx.live().processed();
    ctx.start_live()
        .await
        .map_err(|e| miette::miette!("failed to subscribe: {}", e))?;
    let last = remote.replay_live();
    if last > 0 {
        let done = tokio::time::timeout(LIVE_WAIT, processed.wait_for(|seq| *seq >= last)).await;
        if done.is_err() {
            warn!(last_seq = last, "timed out waiting for live events");
        }
    }

    let pending = timeline.current().map_or(0, |p| p.pending_count);
    println!("== live: {} events, {} new posts waiting", remote.live_events().len(), pending);

    let page = timeline
        .show_new_posts()
        .await
        .map_err(|e| miette::miette!("failed to show new posts: {}", e))?;
    println!("== feed after live updates");
    print!("{}", render::feed(&page, &channels));

    let written = ctx
        .checkpoint()
        .await
        .map_err(|e| miette::miette!("checkpoint failed: {}", e))?;
    info!(entries = written, "checkpointed");
    ctx.shutdown().await;
    Ok(())
}
