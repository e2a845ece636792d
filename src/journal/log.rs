//! Append-only commit log.
//!
//! File layout: a header (magic, format version, position high-water mark)
//! followed by one frame per commit. A frame is
//! `magic | payload length (u32) | MessagePack payload | CRC32 of payload`.

use crate::error::{Result, StoreError};
use crate::types::{EventEnvelope, Position, StreamVersion, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the commit log.
const LOG_MAGIC: &[u8; 4] = b"EVL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// magic + version + high-water mark
pub(crate) const HEADER_SIZE: u64 = 4 + 1 + 8;

/// Magic bytes opening every commit frame.
const FRAME_MAGIC: &[u8; 4] = b"CMT\0";

/// magic + length
const FRAME_HEADER_SIZE: u64 = 4 + 4;

const FRAME_TRAILER_SIZE: u64 = 4;

/// 256MB sanity limit per commit.
const MAX_FRAME_PAYLOAD: u64 = 256 * 1024 * 1024;

/// One atomic append to a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Global position assigned to this commit.
    pub position: Position,

    pub stream_id: String,

    /// Stream version after this commit.
    pub version: StreamVersion,

    pub committed_at: Timestamp,

    /// Events in stream order. May be empty after administrative deletes.
    pub events: Vec<EventEnvelope>,
}

/// Result of decoding one frame from disk.
enum Frame {
    Complete { commit: Commit, len: u64 },
    /// The file ends inside this frame (interrupted write).
    Torn,
    Corrupt(String),
}

struct LogFile {
    file: File,
    size: u64,
    writes_since_sync: u64,

    /// A failed append could not be rolled back; the tail past `size` is
    /// unknown until the log is reopened.
    damaged: bool,
}

impl LogFile {
    /// Cut the file back to `offset` after a failed append.
    fn roll_back(&mut self, path: &Path, offset: u64) {
        if let Err(e) = self.file.set_len(offset) {
            warn!(
                path = %path.display(),
                offset,
                error = %e,
                "Failed to roll back commit log after failed append"
            );
            self.damaged = true;
        }
    }
}

/// What was found when opening an existing log.
pub struct Replay {
    /// Commits with their frame offsets, in file order.
    pub commits: Vec<(u64, Commit)>,

    /// High-water mark stored in the header.
    pub base_position: Position,

    /// Bytes dropped from an interrupted tail frame.
    pub truncated_bytes: u64,
}

/// Append-only commit log.
pub struct CommitLog {
    /// Path to the log file.
    path: PathBuf,

    inner: Mutex<LogFile>,

    /// Sync every N commits (0 and 1 both mean every commit).
    sync_interval: u64,
}

impl CommitLog {
    /// Sync every commit unless configured otherwise.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a commit log, replaying existing frames.
    ///
    /// An interrupted tail frame is cut off. A damaged frame followed by more
    /// data is reported as corruption.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();

        let exists = path.exists() && fs::metadata(&path)?.len() > 0;
        let (file, replay) = if exists {
            Self::recover(&path)?
        } else {
            let file = Self::create_file(&path, Position(0))?;
            (
                file,
                Replay {
                    commits: Vec::new(),
                    base_position: Position(0),
                    truncated_bytes: 0,
                },
            )
        };

        let size = file.metadata()?.len();
        let log = Self {
            path,
            inner: Mutex::new(LogFile {
                file,
                size,
                writes_since_sync: 0,
                damaged: false,
            }),
            sync_interval: sync_interval.max(1),
        };

        Ok((log, replay))
    }

    /// Append a commit. Returns the offset of its frame.
    ///
    /// If the write or its sync fails the file is cut back to where the frame
    /// started, so a failed append never resurfaces on replay.
    pub fn append(&self, commit: &Commit) -> Result<u64> {
        let frame = encode_frame(commit)?;

        let mut inner = self.inner.lock();
        if inner.damaged {
            return Err(StoreError::Corruption(format!(
                "Commit log {} has an unrecoverable tail; reopen the store",
                self.path.display()
            )));
        }

        let offset = inner.size;
        let sync = inner.writes_since_sync + 1 >= self.sync_interval;
        if let Err(e) = write_frame(&mut inner.file, offset, &frame, sync) {
            inner.roll_back(&self.path, offset);
            return Err(e.into());
        }

        inner.size = offset + frame.len() as u64;
        inner.writes_since_sync = if sync { 0 } else { inner.writes_since_sync + 1 };

        Ok(offset)
    }

    /// Read the commit whose frame starts at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Commit> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        if offset < HEADER_SIZE || offset >= size {
            return Err(StoreError::Corruption(format!(
                "Commit offset {} outside log (size {})",
                offset, size
            )));
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut inner.file);
        match read_frame(&mut reader, size - offset)? {
            Frame::Complete { commit, .. } => Ok(commit),
            Frame::Torn => Err(StoreError::Corruption(format!(
                "Truncated commit frame at offset {}",
                offset
            ))),
            Frame::Corrupt(reason) => Err(StoreError::Corruption(format!(
                "{} at offset {}",
                reason, offset
            ))),
        }
    }

    /// Replace the whole log with `commits`, keeping `base_position` as the
    /// high-water mark. Returns the new frame offsets, in input order.
    ///
    /// The new log is written next to the old one, synced and renamed over it.
    pub fn rewrite(&self, base_position: Position, commits: &[Commit]) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock();

        let tmp_path = self.path.with_extension("log.tmp");
        let mut tmp = Self::create_file(&tmp_path, base_position)?;

        let mut offsets = Vec::with_capacity(commits.len());
        let mut offset = HEADER_SIZE;
        for commit in commits {
            let frame = encode_frame(commit)?;
            tmp.write_all(&frame)?;
            offsets.push(offset);
            offset += frame.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.size = file.metadata()?.len();
        inner.file = file;
        inner.writes_since_sync = 0;
        inner.damaged = false;

        Ok(offsets)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Get current file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_file(path: &Path, base_position: Position) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.write_all(&base_position.0.to_le_bytes())?;
        file.sync_all()?;
        sync_parent_dir(path);

        Ok(file)
    }

    /// Scan an existing log, truncating an interrupted tail frame.
    fn recover(path: &Path) -> Result<(File, Replay)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut reader = BufReader::new(file.try_clone()?);
        let base_position = read_header(&mut reader)?;

        let mut commits = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut truncated_bytes = 0;

        while offset < file_size {
            match read_frame(&mut reader, file_size - offset)? {
                Frame::Complete { commit, len } => {
                    commits.push((offset, commit));
                    offset += len;
                }
                Frame::Torn => {
                    truncated_bytes = file_size - offset;
                    warn!(
                        path = %path.display(),
                        offset,
                        truncated_bytes,
                        "Truncating interrupted commit at end of log"
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Frame::Corrupt(reason) => {
                    return Err(StoreError::Corruption(format!(
                        "{} at offset {}",
                        reason, offset
                    )));
                }
            }
        }

        Ok((
            file,
            Replay {
                commits,
                base_position,
                truncated_bytes,
            },
        ))
    }
}

fn read_header(reader: &mut impl Read) -> Result<Position> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid commit log magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported commit log version: {}",
            version[0]
        )));
    }

    let mut base = [0u8; 8];
    reader.read_exact(&mut base)?;
    Ok(Position(u64::from_le_bytes(base)))
}

fn write_frame(file: &mut File, offset: u64, frame: &[u8], sync: bool) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(frame)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn encode_frame(commit: &Commit) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(commit)?;
    if payload.len() as u64 > MAX_FRAME_PAYLOAD {
        return Err(StoreError::Validation(format!(
            "Commit of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(payload.len() + 12);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode the frame at the reader's position. `remaining` is the number of
/// bytes between the frame start and the end of the file.
fn read_frame(reader: &mut impl Read, remaining: u64) -> Result<Frame> {
    if remaining < FRAME_HEADER_SIZE {
        return Ok(Frame::Torn);
    }

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FRAME_MAGIC {
        return Ok(Frame::Corrupt("Invalid frame magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as u64;
    if len > MAX_FRAME_PAYLOAD {
        return Ok(Frame::Corrupt("Commit frame too large".into()));
    }

    let frame_len = FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE;
    if frame_len > remaining {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        // A bad checksum on the very last frame is an interrupted write.
        if frame_len == remaining {
            return Ok(Frame::Torn);
        }
        return Ok(Frame::Corrupt(
            StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            }
            .to_string(),
        ));
    }

    match rmp_serde::from_slice::<Commit>(&payload) {
        Ok(commit) => Ok(Frame::Complete {
            commit,
            len: frame_len,
        }),
        Err(e) => Ok(Frame::Corrupt(format!("Undecodable commit: {}", e))),
    }
}

/// Best effort: persist the directory entry of a new or renamed file.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
