//! The terminal `StreamClosedEvent` sentinel.
//!
//! Once appended, the sentinel is the last event of its stream forever. It is
//! how a reader that only knows the old stream location discovers the new one.

use crate::errors::EventStoreError;
use crate::event_store::{EventToWrite, RecordedEvent};
use crate::types::{EventId, EventTypeName, EventVersion, MigrationId, StreamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved event type name of the closing sentinel.
pub const STREAM_CLOSED_EVENT_TYPE: &str = "streamshift.StreamClosed";

/// Why a stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureReason {
    /// Closed after its events moved to a new stream.
    Migration,
    /// Closed because it grew past a size limit and continues elsewhere.
    SizeLimit,
    /// Closed so its data could be archived.
    Archival,
    /// Closed by an operator.
    Manual,
}

impl std::fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migration => write!(f, "Migration"),
            Self::SizeLimit => write!(f, "SizeLimit"),
            Self::Archival => write!(f, "Archival"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

/// Full coordinates of a stream: where its events and documents live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLocation {
    /// The stream identifier
    pub stream_id: StreamId,
    /// Kind of stream (e.g. "blob", "table")
    pub stream_type: String,
    /// Name of the store holding the events
    pub data_store: String,
    /// Name of the store holding the object document
    pub document_store: String,
}

impl StreamLocation {
    /// Location with only a stream id; store names are left empty.
    pub fn stream(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            stream_type: String::new(),
            data_store: String::new(),
            document_store: String::new(),
        }
    }
}

/// Terminal event pointing readers at the stream's continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamClosedEvent {
    /// Stream that continues this one
    pub continuation_stream_id: StreamId,
    /// Kind of the continuation stream
    pub continuation_stream_type: String,
    /// Store holding the continuation's events
    pub continuation_data_store: String,
    /// Store holding the continuation's document
    pub continuation_document_store: String,
    /// Why the stream was closed
    pub reason: ClosureReason,
    /// When the stream was closed
    pub closed_at: Timestamp,
    /// Migration that closed the stream, if any
    pub migration_id: Option<MigrationId>,
    /// Version of the last business event before the sentinel
    pub last_business_event_version: EventVersion,
    /// Caller supplied metadata
    pub metadata: Option<BTreeMap<String, String>>,
}

impl StreamClosedEvent {
    /// Builds a sentinel pointing at `continuation`.
    pub fn new(
        continuation: &StreamLocation,
        reason: ClosureReason,
        last_business_event_version: EventVersion,
    ) -> Self {
        Self {
            continuation_stream_id: continuation.stream_id.clone(),
            continuation_stream_type: continuation.stream_type.clone(),
            continuation_data_store: continuation.data_store.clone(),
            continuation_document_store: continuation.document_store.clone(),
            reason,
            closed_at: Timestamp::now(),
            migration_id: None,
            last_business_event_version,
            metadata: None,
        }
    }

    /// Records the migration that closed the stream.
    #[must_use]
    pub const fn with_migration_id(mut self, migration_id: MigrationId) -> Self {
        self.migration_id = Some(migration_id);
        self
    }

    /// Attaches caller metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }

    /// Encodes the sentinel as an appendable event.
    pub fn to_event_to_write(&self) -> EventToWrite {
        EventToWrite {
            event_id: EventId::new(),
            event_type: EventTypeName::try_new(STREAM_CLOSED_EVENT_TYPE)
                .expect("reserved sentinel type name is valid"),
            payload: serde_json::to_value(self)
                .expect("StreamClosedEvent contains only JSON-representable fields"),
            metadata: BTreeMap::new(),
        }
    }

    /// Decodes the sentinel from a recorded event.
    ///
    /// Returns `Ok(None)` when the event is not a sentinel.
    pub fn from_recorded(event: &RecordedEvent) -> Result<Option<Self>, EventStoreError> {
        if !event.is_stream_closed() {
            return Ok(None);
        }
        serde_json::from_value(event.payload.clone())
            .map(Some)
            .map_err(|error| EventStoreError::SerializationFailed {
                stream: event.stream_id.clone(),
                detail: error.to_string(),
            })
    }
}
