//! In-memory indices over the commit log.
//!
//! Not persisted: the store rebuilds the index by replaying the log on open.

use super::log::Commit;
use crate::types::{EventKey, Position, StreamVersion};
use std::collections::{BTreeMap, HashMap};

/// Per-stream bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct StreamEntry {
    /// Current version (survives single-event deletes).
    pub version: StreamVersion,

    /// Frame offsets of the stream's commits, in commit order.
    pub commits: Vec<u64>,

    pub event_count: usize,
}

/// Index mapping streams, event keys and feed positions to frame offsets.
#[derive(Debug, Default)]
pub struct EventIndex {
    streams: HashMap<String, StreamEntry>,

    /// (source, id) -> frame offset of the commit holding the event.
    keys: HashMap<EventKey, u64>,

    /// Global position -> frame offset.
    feed: BTreeMap<Position, u64>,

    /// Highest position ever assigned.
    head: Position,

    event_count: u64,
}

impl EventIndex {
    /// Create an empty index whose positions continue after `base`.
    pub fn new(base: Position) -> Self {
        Self {
            head: base,
            ..Default::default()
        }
    }

    /// Build an index from replayed commits.
    pub fn rebuild<'a>(base: Position, commits: impl IntoIterator<Item = (u64, &'a Commit)>) -> Self {
        let mut index = Self::new(base);
        for (offset, commit) in commits {
            index.add(offset, commit);
        }
        index
    }

    /// Add a commit stored at `offset`.
    pub fn add(&mut self, offset: u64, commit: &Commit) {
        let entry = self.streams.entry(commit.stream_id.clone()).or_default();
        entry.version = entry.version.max(commit.version);
        entry.commits.push(offset);
        entry.event_count += commit.events.len();

        for event in &commit.events {
            self.keys.insert(event.key(), offset);
        }

        self.feed.insert(commit.position, offset);
        self.head = self.head.max(commit.position);
        self.event_count += commit.events.len() as u64;
    }

    pub fn stream(&self, stream_id: &str) -> Option<&StreamEntry> {
        self.streams.get(stream_id)
    }

    /// Current version of a stream (0 if it was never written).
    pub fn stream_version(&self, stream_id: &str) -> StreamVersion {
        self.streams
            .get(stream_id)
            .map(|s| s.version)
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &EventKey) -> bool {
        self.keys.contains_key(key)
    }

    /// Offset of the commit containing an event.
    pub fn offset_of(&self, key: &EventKey) -> Option<u64> {
        self.keys.get(key).copied()
    }

    /// Offsets of up to `limit` commits strictly after `after`.
    pub fn offsets_after(&self, after: Position, limit: usize) -> Vec<u64> {
        self.feed
            .range(after.next()..)
            .take(limit)
            .map(|(_, offset)| *offset)
            .collect()
    }

    /// All commit offsets in position order.
    pub fn all_offsets(&self) -> Vec<u64> {
        self.feed.values().copied().collect()
    }

    /// Highest position ever assigned.
    pub fn head(&self) -> Position {
        self.head
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn commit_count(&self) -> usize {
        self.feed.len()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}
