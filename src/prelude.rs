//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use livestack_sdk::prelude::*;
//!
//! let client = LiveStack::connect(stack).await?;
//! let mut stream = client.list_view::<Round>("Round/list").watch(WatchOptions::default());
//! while let Some(update) = stream.next().await {
//!     // StreamExt methods available without a separate import
//! }
//! ```

pub use crate::{
    ConnectionState, LiveStack, LiveStackBuilder, LiveStackConfig, LiveStackError, ListView,
    RichUpdate, StackDefinition, StateView, Subscription, Update, ViewMode, WatchOptions,
};

pub use futures_util::StreamExt;
