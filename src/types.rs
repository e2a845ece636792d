//! Core types for the event store.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of events committed to a stream (0 = empty stream).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StreamVersion(pub u64);

impl StreamVersion {
    pub fn next(self) -> Self {
        StreamVersion(self.0 + 1)
    }

    /// Version after appending `count` events.
    pub fn advance(self, count: usize) -> Self {
        StreamVersion(self.0 + count as u64)
    }
}

impl fmt::Debug for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global commit position, shared by all streams.
///
/// Every successful append is assigned the next position. Position 0 means
/// "before the first commit".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position(pub u64);

impl Position {
    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single event, as written by a producer and as stored by the engine.
///
/// `stream_id` and `stream_version` are assigned by the store when the event
/// is committed; whatever the writer puts there is overwritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique within `source`.
    pub id: String,

    /// Origin URI of the event.
    pub source: String,

    /// Logical event type name.
    pub event_type: String,

    pub subject: Option<String>,

    /// Caller-supplied event time.
    pub time: Option<Timestamp>,

    pub data_content_type: Option<String>,

    /// Opaque serialized payload.
    pub data: Vec<u8>,

    /// Stream this event was committed to (assigned by store).
    pub stream_id: String,

    /// Position within the stream, starting at 1 (assigned by store).
    pub stream_version: StreamVersion,
}

impl EventEnvelope {
    /// Create an envelope with no payload.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            subject: None,
            time: None,
            data_content_type: None,
            data: Vec::new(),
            stream_id: String::new(),
            stream_version: StreamVersion(0),
        }
    }

    /// Create an envelope with a JSON payload.
    pub fn json(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(id, source, event_type)
            .with_data("application/json", serde_json::to_vec(payload)?))
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_data(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.data_content_type = Some(content_type.into());
        self.data = data;
        self
    }

    /// Decode a JSON payload into a domain type.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// The global `(source, id)` key.
    pub fn key(&self) -> EventKey {
        EventKey::new(&self.id, &self.source)
    }

    /// Check the attributes every stored event must carry.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::Validation("event id cannot be empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "event {} has an empty source",
                self.id
            )));
        }
        if self.event_type.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "event {} has an empty type",
                self.id
            )));
        }
        Ok(())
    }
}

/// Globally unique identity of an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub source: String,
    pub id: String,
}

impl EventKey {
    pub fn new(id: &str, source: &str) -> Self {
        Self {
            source: source.to_string(),
            id: id.to_string(),
        }
    }
}

/// Events of one stream together with its current version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventStream {
    pub id: String,
    pub version: StreamVersion,
    pub events: Vec<EventEnvelope>,
}

impl EventStream {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: StreamVersion(0),
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub stream_count: u64,
    pub event_count: u64,
    pub commit_count: u64,
    pub head: Position,
    pub log_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_navigation() {
        assert_eq!(StreamVersion(5).next(), StreamVersion(6));
        assert_eq!(StreamVersion(2).advance(3), StreamVersion(5));
        assert_eq!(Position(0).next(), Position(1));
    }

    #[test]
    fn test_envelope_json() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct NameDefined {
            name: String,
        }

        let event = EventEnvelope::json(
            "e1",
            "urn:names",
            "NameDefined",
            &NameDefined {
                name: "alice".into(),
            },
        )
        .unwrap()
        .with_subject("alice");

        assert_eq!(event.data_content_type.as_deref(), Some("application/json"));
        assert_eq!(event.subject.as_deref(), Some("alice"));
        let decoded: NameDefined = event.decode_json().unwrap();
        assert_eq!(decoded.name, "alice");
    }

    #[test]
    fn test_validate_rejects_missing_attributes() {
        assert!(EventEnvelope::new("e1", "urn:s", "T").validate().is_ok());
        assert!(matches!(
            EventEnvelope::new("", "urn:s", "T").validate(),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            EventEnvelope::new("e1", " ", "T").validate(),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            EventEnvelope::new("e1", "urn:s", "").validate(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_event_key_identity() {
        let a = EventEnvelope::new("e1", "urn:a", "T");
        let b = EventEnvelope::new("e1", "urn:b", "T");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), EventKey::new("e1", "urn:a"));
    }
}
