//! # Eventide
//!
//! An embedded event store: append-only event streams with optimistic
//! concurrency, plus durable change-feed subscriptions.
//!
//! ## Core Concepts
//!
//! - **Streams**: Ordered events under a stream id, versioned from 1
//! - **Commits**: One atomic append, one position on the change feed
//! - **Subscriptions**: Background listeners that resume from a saved token
//! - **Admin**: Out-of-band deletion and correction of stored events
//!
//! ## Example
//!
//! ```ignore
//! use eventide::{EventEnvelope, EventStore, StoreConfig, StreamVersion};
//!
//! let store = EventStore::open_or_create(StoreConfig::new("./my-events"))?;
//!
//! // Append to a new stream
//! let placed = EventEnvelope::json("evt-1", "urn:shop", "OrderPlaced", &json!({
//!     "total": 42
//! }))?;
//! let version = store.append("order-42", StreamVersion(0), vec![placed])?;
//!
//! // Rehydrate
//! let stream = store.read("order-42")?;
//! assert_eq!(stream.version, version);
//! ```

pub mod admin;
pub mod error;
pub mod filter;
pub mod journal;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use error::{Result, StoreError};
pub use filter::{Composition, Condition, Field, FieldValue, Filter};
pub use journal::{Commit, CommitLog, EventIndex};
pub use store::{EventStore, StoreConfig};
pub use subscriptions::{
    CallbackError, CallbackResult, ChangeFeed, PositionTracker, ResumeToken, ResumeTokenRecord,
    ResumeTokenStore, RetryPolicy, SubscriptionConfig, SubscriptionHandle, SubscriptionManager,
    SubscriptionStatus,
};
pub use types::*;
