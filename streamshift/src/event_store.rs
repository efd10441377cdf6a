//! Storage contract consumed by the migration engine.
//!
//! The engine never talks to a concrete backend. It only needs an
//! append/read/conditional-write contract from storage adapters, expressed by
//! the [`EventStore`] trait. Events are opaque typed records: a type name, a
//! JSON payload and a version.

use crate::errors::EventStoreResult;
use crate::stream_closed::STREAM_CLOSED_EVENT_TYPE;
use crate::types::{EventId, EventTypeName, EventVersion, StreamId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key marking an event mirrored back into the old stream while the
/// new stream is primary. The value names the stream the event was written to.
///
/// Such events are already in the new stream's representation and are never
/// run through a transformer again.
pub const MIRRORED_FROM_METADATA_KEY: &str = "streamshift.mirroredFrom";

/// An event as it exists in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// The stream this event belongs to
    pub stream_id: StreamId,
    /// The version of this event within its stream
    pub version: EventVersion,
    /// The event's type name
    pub event_type: EventTypeName,
    /// The opaque event payload
    pub payload: serde_json::Value,
    /// When this event was stored
    pub recorded_at: Timestamp,
    /// Free-form metadata (correlation ids, schema versions, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RecordedEvent {
    /// Whether this event is the terminal `StreamClosedEvent` sentinel.
    pub fn is_stream_closed(&self) -> bool {
        self.event_type.as_ref() == STREAM_CLOSED_EVENT_TYPE
    }

    /// Primary stream this event was mirrored from, if it is a mirror copy.
    pub fn mirrored_from(&self) -> Option<&str> {
        self.metadata.get(MIRRORED_FROM_METADATA_KEY).map(String::as_str)
    }

    /// The write to copy this event unchanged into the stream it was
    /// mirrored from, without the mirror marker.
    pub fn to_unmirrored_write(&self) -> EventToWrite {
        let mut write = self.to_event_to_write();
        let _ = write.metadata.remove(MIRRORED_FROM_METADATA_KEY);
        write
    }

    /// Approximate stored size of the event payload in bytes.
    pub fn payload_size(&self) -> u64 {
        self.payload.to_string().len() as u64
    }

    /// Turns the recorded event back into a write, keeping its identity.
    pub fn to_event_to_write(&self) -> EventToWrite {
        EventToWrite {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// An event to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventToWrite {
    /// Unique identifier for this event (must be `UUIDv7`)
    pub event_id: EventId,
    /// The event's type name
    pub event_type: EventTypeName,
    /// The opaque event payload
    pub payload: serde_json::Value,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl EventToWrite {
    /// Creates a new event with a fresh id and no metadata.
    pub fn new(event_type: EventTypeName, payload: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this write is the terminal `StreamClosedEvent` sentinel.
    pub fn is_stream_closed(&self) -> bool {
        self.event_type.as_ref() == STREAM_CLOSED_EVENT_TYPE
    }
}

/// Expected version for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The stream must not contain any events
    NoStream,
    /// The stream must be at exactly this version
    Exact(EventVersion),
    /// Any version is acceptable (no concurrency control)
    Any,
}

impl ExpectedVersion {
    /// Whether a stream currently at `current` satisfies this expectation.
    pub fn matches(self, current: EventVersion) -> bool {
        match self {
            Self::NoStream => current == EventVersion::initial(),
            Self::Exact(expected) => current == expected,
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(version) => write!(f, "{version}"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Configuration for reading a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Start reading from this version (inclusive). None = from beginning
    pub from_version: Option<EventVersion>,
    /// Stop reading at this version (inclusive). None = to end
    pub to_version: Option<EventVersion>,
    /// Maximum number of events to read (None = no limit)
    pub max_events: Option<usize>,
}

impl ReadOptions {
    /// Creates new read options with default values.
    pub const fn new() -> Self {
        Self {
            from_version: None,
            to_version: None,
            max_events: None,
        }
    }

    /// Sets the starting version.
    #[must_use]
    pub const fn from_version(mut self, version: EventVersion) -> Self {
        self.from_version = Some(version);
        self
    }

    /// Sets the ending version.
    #[must_use]
    pub const fn to_version(mut self, version: EventVersion) -> Self {
        self.to_version = Some(version);
        self
    }

    /// Sets the maximum number of events to read.
    #[must_use]
    pub const fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }
}

/// The storage contract every adapter must satisfy.
///
/// Adapters must reject any append to a stream whose last event is a
/// `StreamClosedEvent`, and any batch that places events after one.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream if its version matches `expected`.
    ///
    /// Returns the stream's new version.
    ///
    /// # Errors
    /// * `EventStoreError::VersionConflict` - the expectation did not hold
    /// * `EventStoreError::StreamClosed` - the stream was terminated
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> EventStoreResult<EventVersion>;

    /// Reads events in version order. A missing stream reads as empty.
    async fn read(
        &self,
        stream_id: &StreamId,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<RecordedEvent>>;

    /// Current version of a stream, `EventVersion::initial()` when absent.
    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<EventVersion>;

    /// Irreversibly removes a stream's raw data.
    async fn delete_stream(&self, stream_id: &StreamId) -> EventStoreResult<()>;
}

/// Reads a whole stream.
pub async fn read_all<S>(store: &S, stream_id: &StreamId) -> EventStoreResult<Vec<RecordedEvent>>
where
    S: EventStore + ?Sized,
{
    store.read(stream_id, &ReadOptions::new()).await
}

/// Reads the last event of a stream, if any.
pub async fn last_event<S>(store: &S, stream_id: &StreamId) -> EventStoreResult<Option<RecordedEvent>>
where
    S: EventStore + ?Sized,
{
    let version = store.stream_version(stream_id).await?;
    if version == EventVersion::initial() {
        return Ok(None);
    }
    let events = store
        .read(stream_id, &ReadOptions::new().from_version(version).to_version(version))
        .await?;
    Ok(events.into_iter().last())
}
