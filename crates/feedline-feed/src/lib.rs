//! Feed engine for Feedline.
//!
//! ## Features
//!
//! - **Timeline**: merges per-channel pages into one reverse-chronological
//!   feed, groups albums and pages backwards with a composite cursor
//! - **Comments**: threaded discussions with optimistic posting and a
//!   depth-limited layout
//! - **Live updates**: sequence-numbered events reconciled into loaded feeds
//!   and threads, with new posts held back while the reader is scrolled away
//! - **Context**: one object owning the caches, engines and background tasks
//!   from startup to logout
//!
//! The remote service sits behind [`RemoteClient`]; [`FixtureRemote`] serves
//! a JSON fixture for tests and offline replay.

pub mod cached;
pub mod comments;
pub mod context;
pub mod directory;
mod error;
pub mod fixture;
pub mod groups;
pub mod keys;
pub mod live;
pub mod normalize;
pub mod options;
pub mod raw;
pub mod reactions;
pub mod remote;
pub mod timeline;
pub mod types;

pub use cached::CachedData;
pub use comments::{CommentEngine, ThreadRow, ThreadView};
pub use context::FeedContext;
pub use directory::ChannelDirectory;
pub use error::FeedError;
pub use fixture::{Fixture, FixtureRemote, FixtureThread};
pub use groups::aggregate;
pub use live::{ApplyOutcome, IgnoreReason, LiveEnvelope, LiveEvent, LiveReconciler};
pub use options::{CommentConfig, DirectoryConfig, FeedConfig, QueryPresets, TimelineConfig};
pub use remote::{LiveSubscription, RemoteClient, UnsubscribeHandle};
pub use timeline::{FeedPage, TimelineData, TimelineEngine};
pub use types::{
    Author, Channel, ChannelId, Comment, CommentThread, FeedCursor, MessageId, Post, PostKey,
    Reaction, TimelineItem,
};
