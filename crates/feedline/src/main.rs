//! Feedline: channel feed engine tools
//!
//! Main binary with subcommands:
//! - `replay`: Run the feed engine over a JSON fixture and print the feed
//! - `snapshot`: Inspect or clear the persisted query cache

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use feedline_feed::FeedConfig;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod render;
mod replay;
mod snapshot;

#[derive(Parser)]
#[command(name = "feedline")]
#[command(about = "Channel feed engine tools", long_about = None)]
struct Cli {
    /// Directory holding the persisted cache
    #[arg(long, env = "FEEDLINE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Cache version; a change drops the stored snapshot and media
    #[arg(long, env = "FEEDLINE_CACHE_VERSION")]
    cache_version: Option<String>,

    /// JSON file with engine settings
    #[arg(long, env = "FEEDLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a fixture, print the feed, replay its live events and print again
    Replay {
        /// Fixture file
        #[arg(long)]
        fixture: PathBuf,

        /// Treat the reader as scrolled away so new posts are held back
        #[arg(long)]
        scrolled_away: bool,
    },

    /// Inspect the persisted query cache
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Print the snapshot timestamp and stored keys
    Show,
    /// Delete the snapshot, the version marker and persisted media
    Clear,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedline")
}

async fn load_config(path: Option<&Path>, cache_version: Option<String>) -> Result<FeedConfig> {
    let mut config = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
            serde_json::from_str(&text).into_diagnostic()?
        }
        None => FeedConfig::default(),
    };
    if let Some(version) = cache_version {
        config.cache.cache_version = version;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "feedline=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(cli.config.as_deref(), cli.cache_version).await?;

    match cli.command {
        Commands::Replay {
            fixture,
            scrolled_away,
        } => replay::run(&data_dir, config, &fixture, scrolled_away).await,
        Commands::Snapshot { action } => match action {
            SnapshotAction::Show => snapshot::show(&data_dir, config).await,
            SnapshotAction::Clear => snapshot::clear(&data_dir, config).await,
        },
    }
}
