//! # livestack-sdk
//!
//! Rust client runtime for LiveStack real-time entity-view streaming
//! servers.
//!
//! The client keeps a long-lived WebSocket session, materializes
//! server-pushed frames into a per-view in-memory store, deduplicates and
//! reference-counts subscriptions across consumers, and exposes changes
//! both as typed async streams and as point-in-time reads.
//!
//! ## Example
//!
//! ```rust,ignore
//! use livestack_sdk::prelude::*;
//!
//! let client = LiveStack::builder()
//!     .url("ws://localhost:8877")
//!     .connect()
//!     .await?;
//!
//! let rounds = client.list_view::<Round>("Round/list");
//! let mut updates = rounds.watch(WatchOptions::default());
//! while let Some(update) = updates.next().await {
//!     println!("round changed: {:?}", update.key());
//! }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod frame;
mod processor;
mod registry;
mod stack;
mod store;
mod stream;
mod subscription;
mod view;

pub mod prelude;

pub use client::{LiveStack, LiveStackBuilder};
pub use config::{ConnectionConfig, LiveStackConfig, DEFAULT_MAX_ENTRIES_PER_VIEW};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::LiveStackError;
pub use frame::{
    decode_binary, decode_text, EntityFrame, EntityOp, Frame, Mode, SnapshotEntity, SnapshotFrame,
    SortConfig, SortOrder, SubscribedFrame,
};
pub use processor::{deep_merge_with_append, FrameProcessor};
pub use registry::{SubscriptionGuard, SubscriptionRegistry, SubscriptionSink};
pub use stack::{StackDefinition, StackViews, ViewDef, ViewMode};
pub use store::{
    MemoryStore, RichChange, RichStoreUpdate, Storage, StoreUpdate, UpdateKind, UPDATE_BACKLOG,
};
pub use stream::{Coalesced, KeyFilter, RichUpdate, RichUpdateStream, Update, UpdateStream};
pub use subscription::{ClientMessage, Subscription, SubscriptionSet, Unsubscription};
pub use view::{ListView, StateView, WatchOptions};

pub use serde_json::Value;
