//! Durable storage layout of the event store.
//!
//! Commits are stored in an append-only log; an in-memory index maps
//! streams, event keys and feed positions to frame offsets.

mod index;
mod log;

pub use index::{EventIndex, StreamEntry};
pub use log::{Commit, CommitLog, Replay};
