//! Durable resume positions per subscription.

use crate::error::{Result, StoreError};
use crate::types::Position;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the resume token file.
const TOKENS_MAGIC: &[u8; 4] = b"RTK\0";

/// Current resume token file format version.
const TOKENS_VERSION: u8 = 1;

/// Opaque marker of the last fully processed commit of a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResumeToken(Position);

impl ResumeToken {
    pub fn new(position: Position) -> Self {
        ResumeToken(position)
    }

    pub fn position(&self) -> Position {
        self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0 .0.to_be_bytes())
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(ResumeToken(Position(u64::from_be_bytes(arr))))
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({})", self.to_hex())
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Persisted record, one per active or paused subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTokenRecord {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "resumeToken")]
    pub resume_token: ResumeToken,
}

/// Storage for subscription resume positions.
///
/// The subscription manager is the only writer.
pub trait PositionTracker: Send + Sync {
    /// Persisted token for a subscription, if any.
    fn load(&self, subscription_id: &str) -> Result<Option<ResumeToken>>;

    /// Insert or replace the token of a subscription.
    fn save(&self, subscription_id: &str, token: ResumeToken) -> Result<()>;

    /// Forget a subscription. Unknown ids are ignored.
    fn remove(&self, subscription_id: &str) -> Result<()>;

    /// Ids of all subscriptions with a token.
    fn ids(&self) -> Result<Vec<String>>;
}

/// File-backed [`PositionTracker`].
///
/// Every change rewrites the (small) token file through a temp file and an
/// atomic rename, so a crash leaves either the old or the new content.
pub struct ResumeTokenStore {
    /// Path to the token file.
    path: PathBuf,

    records: RwLock<HashMap<String, ResumeTokenRecord>>,
}

impl ResumeTokenStore {
    /// Create an empty token store. Nothing is written until the first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Load the token store from file (empty if the file doesn't exist).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(path);
        if store.path.exists() {
            let records = store.load_from_file()?;
            *store.records.write() = records;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Write all records to disk. Caller holds the write lock.
    fn persist(&self, records: &HashMap<String, ResumeTokenRecord>) -> Result<()> {
        let mut sorted: Vec<&ResumeTokenRecord> = records.values().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let encoded = rmp_serde::to_vec_named(&sorted)?;

        let tmp_path = self.path.with_extension("bin.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(TOKENS_MAGIC)?;
            file.write_all(&[TOKENS_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn load_from_file(&self) -> Result<HashMap<String, ResumeTokenRecord>> {
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TOKENS_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid resume token file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TOKENS_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported resume token file version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let records: Vec<ResumeTokenRecord> = rmp_serde::from_slice(&encoded)?;
        Ok(records.into_iter().map(|r| (r.id.clone(), r)).collect())
    }
}

impl PositionTracker for ResumeTokenStore {
    fn load(&self, subscription_id: &str) -> Result<Option<ResumeToken>> {
        Ok(self
            .records
            .read()
            .get(subscription_id)
            .map(|r| r.resume_token))
    }

    fn save(&self, subscription_id: &str, token: ResumeToken) -> Result<()> {
        let mut records = self.records.write();
        let previous = records.insert(
            subscription_id.to_string(),
            ResumeTokenRecord {
                id: subscription_id.to_string(),
                resume_token: token,
            },
        );

        if let Err(e) = self.persist(&records) {
            // Keep memory in line with what is on disk.
            match previous {
                Some(record) => records.insert(subscription_id.to_string(), record),
                None => records.remove(subscription_id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, subscription_id: &str) -> Result<()> {
        let mut records = self.records.write();
        if let Some(previous) = records.remove(subscription_id) {
            if let Err(e) = self.persist(&records) {
                records.insert(subscription_id.to_string(), previous);
                return Err(e);
            }
        }
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
