//! Durable change-feed subscriptions.
//!
//! A subscription tails the store's change feed on its own thread and hands
//! each commit's events to a handler, in commit order. After the handler
//! returns `Ok`, the commit position is saved as the subscription's resume
//! token, so a paused (or crashed) subscription picks up where it left off.
//!
//! Subscriptions support:
//! - Filtering on envelope attributes
//! - Pause/resume (token kept) and cancel (token removed)
//! - Configurable redelivery of failed batches
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(EventStore::open_or_create(StoreConfig::new("./data"))?);
//! let manager = SubscriptionManager::new(store.clone());
//!
//! let config = SubscriptionConfig {
//!     filter: Filter::event_types(["OrderPlaced"]),
//!     ..Default::default()
//! };
//! manager.subscribe_with("billing", config, |batch: &[EventEnvelope]| -> CallbackResult {
//!     for event in batch {
//!         println!("{} v{}", event.stream_id, event.stream_version);
//!     }
//!     Ok(())
//! })?;
//!
//! // Later: stop, keeping the position.
//! manager.pause_subscription("billing");
//! ```

mod feed;
mod listener;
mod manager;
mod tokens;
mod types;

pub use feed::ChangeFeed;
pub use manager::SubscriptionManager;
pub use tokens::{PositionTracker, ResumeToken, ResumeTokenRecord, ResumeTokenStore};
pub use types::{
    BatchHandler, CallbackError, CallbackResult, RetryPolicy, SubscriptionConfig,
    SubscriptionHandle, SubscriptionStatus,
};
