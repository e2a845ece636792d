//! Administrative operations on stored events.
//!
//! These bypass optimistic concurrency and rewrite the commit log in place
//! (temp file, fsync, rename). Commit positions and the position high-water
//! mark are preserved, so the change feed never hands out a position twice.
//! Administrative changes do not appear on the change feed.

use crate::error::{Result, StoreError};
use crate::journal::{Commit, EventIndex};
use crate::store::EventStore;
use crate::types::{EventEnvelope, EventKey};
use tracing::info;

impl EventStore {
    /// Remove a stream and all of its events. Unknown streams are a no-op.
    pub fn delete_event_stream(&self, stream_id: &str) -> Result<()> {
        let _commit = self.commit_lock.lock();
        let mut index = self.index.write();

        if index.stream(stream_id).is_none() {
            return Ok(());
        }

        let removed = self.rewrite_log(&mut index, |commit| {
            if commit.stream_id == stream_id {
                None
            } else {
                Some(commit)
            }
        })?;

        info!(stream_id, commits = removed, "Deleted event stream");
        Ok(())
    }

    /// Remove a single event. Returns false if no such event exists.
    ///
    /// The stream keeps its version, so writers holding the current version
    /// are not disturbed.
    pub fn delete_event(&self, id: &str, source: &str) -> Result<bool> {
        let key = EventKey::new(id, source);

        let _commit = self.commit_lock.lock();
        let mut index = self.index.write();

        let target = match index.offset_of(&key) {
            Some(offset) => self.log.read_at(offset)?.position,
            None => return Ok(false),
        };

        self.rewrite_log(&mut index, |mut commit| {
            if commit.position == target {
                commit.events.retain(|event| event.key() != key);
            }
            Some(commit)
        })?;

        info!(event_id = id, source, "Deleted event");
        Ok(true)
    }

    /// Replace a single event with the result of `transform`.
    ///
    /// Returns `None` without calling `transform` if the event doesn't exist.
    /// The replacement must validate and keep the same `id` and `source`;
    /// its `stream_id` and `stream_version` are taken from the original.
    ///
    /// `transform` runs while the store is locked for writing and must not
    /// call back into the store.
    pub fn update_event<F>(&self, id: &str, source: &str, transform: F) -> Result<Option<EventEnvelope>>
    where
        F: FnOnce(&EventEnvelope) -> Option<EventEnvelope>,
    {
        let key = EventKey::new(id, source);

        let _commit = self.commit_lock.lock();
        let mut index = self.index.write();

        let offset = match index.offset_of(&key) {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let commit = self.log.read_at(offset)?;
        let current = commit
            .events
            .iter()
            .find(|event| event.key() == key)
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "Event {} from {} missing from commit {}",
                    id, source, commit.position
                ))
            })?;

        let mut replacement = transform(current).ok_or_else(|| {
            StoreError::Validation(format!("update of event {} produced no replacement", id))
        })?;
        replacement.validate()?;
        if replacement.id != current.id || replacement.source != current.source {
            return Err(StoreError::Validation(format!(
                "update of event {} must not change its id or source",
                id
            )));
        }
        replacement.stream_id = current.stream_id.clone();
        replacement.stream_version = current.stream_version;

        let target = commit.position;
        self.rewrite_log(&mut index, |mut commit| {
            if commit.position == target {
                for event in commit.events.iter_mut().filter(|event| event.key() == key) {
                    *event = replacement.clone();
                }
            }
            Some(commit)
        })?;

        info!(event_id = id, source, position = %target, "Updated event");
        Ok(Some(replacement))
    }

    /// Rewrite every commit through `edit` (`None` drops the commit) and
    /// rebuild the index. Returns the number of dropped commits.
    ///
    /// Caller holds the commit lock and the index write lock.
    fn rewrite_log<F>(&self, index: &mut EventIndex, mut edit: F) -> Result<usize>
    where
        F: FnMut(Commit) -> Option<Commit>,
    {
        let base = index.head();

        let mut kept = Vec::with_capacity(index.commit_count());
        let mut dropped = 0;
        for offset in index.all_offsets() {
            match edit(self.log.read_at(offset)?) {
                Some(commit) => kept.push(commit),
                None => dropped += 1,
            }
        }

        let offsets = self.log.rewrite(base, &kept)?;
        *index = EventIndex::rebuild(base, offsets.into_iter().zip(kept.iter()));
        Ok(dropped)
    }
}
