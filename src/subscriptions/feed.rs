//! The change feed consumed by subscriptions.

use crate::error::Result;
use crate::journal::Commit;
use crate::types::Position;
use crossbeam_channel::Receiver;

/// A totally ordered, resumable feed of committed writes.
pub trait ChangeFeed: Send + Sync {
    /// Position of the newest commit ("now").
    fn head(&self) -> Result<Position>;

    /// Up to `limit` commits strictly after `after`, in position order.
    fn commits_after(&self, after: Position, limit: usize) -> Result<Vec<Commit>>;

    /// A channel that receives a (coalesced) wake-up after new commits.
    fn watch(&self) -> Receiver<()>;
}
