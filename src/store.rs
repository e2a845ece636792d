//! Main EventStore struct tying the log, index and resume tokens together.

use crate::error::{Result, StoreError};
use crate::journal::{Commit, CommitLog, EventIndex};
use crate::subscriptions::{ChangeFeed, ResumeTokenStore};
use crate::types::{EventEnvelope, EventStream, Position, StoreStats, StreamVersion, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log every N commits.
    /// Default: 1 (every commit)
    pub sync_interval: u64,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./eventide"),
            create_if_missing: true,
            sync_interval: CommitLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"EVS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const LOG_FILE: &str = "events.log";
const TOKENS_FILE: &str = "subscriptions.bin";

/// The event store.
///
/// Provides a unified interface for:
/// - Appending events to streams with optimistic concurrency
/// - Reading streams back with their current version
/// - A totally ordered change feed over all commits
/// - Resume tokens for feed subscribers
///
/// `EventStore` is `Send + Sync`; share it with `Arc`.
pub struct EventStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    pub(crate) log: CommitLog,

    pub(crate) index: RwLock<EventIndex>,

    tokens: Arc<ResumeTokenStore>,

    /// Feed wake-up senders, pruned when the receiver goes away.
    watchers: Mutex<Vec<Sender<()>>>,

    /// Serializes commits and administrative rewrites.
    pub(crate) commit_lock: Mutex<()>,
}

impl EventStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        Self::load(config, lock_file)
    }

    /// Open an existing store, replaying the log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.join("MANIFEST").exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        Self::load(config, lock_file)
    }

    fn load(config: StoreConfig, lock_file: File) -> Result<Self> {
        let (log, replay) = CommitLog::open(config.path.join(LOG_FILE), config.sync_interval)?;
        let index = EventIndex::rebuild(
            replay.base_position,
            replay.commits.iter().map(|(offset, commit)| (*offset, commit)),
        );
        let tokens = Arc::new(ResumeTokenStore::open(config.path.join(TOKENS_FILE))?);

        info!(
            path = %config.path.display(),
            streams = index.stream_count(),
            commits = index.commit_count(),
            head = %index.head(),
            "Event store opened"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: RwLock::new(index),
            tokens,
            watchers: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
        })
    }

    // --- Stream Operations ---

    /// Append events to a stream.
    ///
    /// `expected_version` must be the stream's current version (0 for a
    /// stream that was never written). All events commit together as one
    /// feed entry, numbered `expected_version + 1 ..` in input order.
    /// Returns the new stream version.
    ///
    /// An empty `events` list writes nothing and returns the current version
    /// once the expected version has been checked.
    pub fn append(
        &self,
        stream_id: &str,
        expected_version: StreamVersion,
        events: Vec<EventEnvelope>,
    ) -> Result<StreamVersion> {
        if stream_id.is_empty() {
            return Err(StoreError::Validation("stream id must not be empty".into()));
        }
        for event in &events {
            event.validate()?;
        }

        let _commit = self.commit_lock.lock();

        let position = {
            let index = self.index.read();

            let actual = index.stream_version(stream_id);
            if actual != expected_version {
                debug!(stream_id, expected = %expected_version, actual = %actual, "Append conflict");
                return Err(StoreError::ConcurrencyConflict {
                    stream_id: stream_id.to_string(),
                    expected: expected_version,
                    actual,
                });
            }

            if events.is_empty() {
                return Ok(actual);
            }

            let mut batch_keys = HashSet::with_capacity(events.len());
            for event in &events {
                let key = event.key();
                if index.contains_key(&key) || !batch_keys.insert(key) {
                    return Err(StoreError::DuplicateEvent {
                        id: event.id.clone(),
                        event_source: event.source.clone(),
                    });
                }
            }

            index.head().next()
        };

        let mut events = events;
        for (i, event) in events.iter_mut().enumerate() {
            event.stream_id = stream_id.to_string();
            event.stream_version = expected_version.advance(i + 1);
        }
        let version = expected_version.advance(events.len());

        let commit = Commit {
            position,
            stream_id: stream_id.to_string(),
            version,
            committed_at: Timestamp::now(),
            events,
        };

        let offset = self.log.append(&commit)?;
        self.index.write().add(offset, &commit);

        debug!(
            stream_id,
            position = %position,
            version = %version,
            events = commit.events.len(),
            "Committed"
        );

        self.notify_watchers();
        Ok(version)
    }

    /// Read a whole stream. Unknown streams read as version 0 with no events.
    pub fn read(&self, stream_id: &str) -> Result<EventStream> {
        self.read_range(stream_id, 0, usize::MAX)
    }

    /// Read up to `limit` events of a stream after skipping `skip`.
    ///
    /// The returned version is always the full stream version.
    pub fn read_range(&self, stream_id: &str, skip: usize, limit: usize) -> Result<EventStream> {
        // Hold the read lock while reading frames so a rewrite can't move them.
        let index = self.index.read();
        let entry = match index.stream(stream_id) {
            Some(entry) => entry,
            None => return Ok(EventStream::empty(stream_id)),
        };

        let mut events = Vec::new();
        let mut skipped = 0;
        'commits: for &offset in &entry.commits {
            let commit = self.log.read_at(offset)?;
            for event in commit.events {
                if events.len() >= limit {
                    break 'commits;
                }
                if skipped < skip {
                    skipped += 1;
                    continue;
                }
                events.push(event);
            }
        }

        Ok(EventStream {
            id: stream_id.to_string(),
            version: entry.version,
            events,
        })
    }

    /// Whether the stream has ever been written (and not deleted).
    pub fn exists(&self, stream_id: &str) -> bool {
        self.index.read().stream(stream_id).is_some()
    }

    /// Current version of a stream.
    pub fn stream_version(&self, stream_id: &str) -> StreamVersion {
        self.index.read().stream_version(stream_id)
    }

    /// Position of the newest commit ("now").
    pub fn position(&self) -> Position {
        self.index.read().head()
    }

    // --- Subscriptions ---

    /// Resume tokens of this store's subscriptions.
    pub fn resume_tokens(&self) -> Arc<ResumeTokenStore> {
        Arc::clone(&self.tokens)
    }

    fn notify_watchers(&self) {
        self.watchers
            .lock()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            stream_count: index.stream_count() as u64,
            event_count: index.event_count(),
            commit_count: index.commit_count() as u64,
            head: index.head(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Sync the log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl ChangeFeed for EventStore {
    fn head(&self) -> Result<Position> {
        Ok(self.position())
    }

    fn commits_after(&self, after: Position, limit: usize) -> Result<Vec<Commit>> {
        let index = self.index.read();
        index
            .offsets_after(after, limit)
            .into_iter()
            .map(|offset| self.log.read_at(offset))
            .collect()
    }

    fn watch(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.watchers.lock().push(tx);
        rx
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(path = %self.config.path.display(), error = %e, "Failed to sync log on close");
        }
    }
}
