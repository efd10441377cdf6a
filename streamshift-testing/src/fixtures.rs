//! Event and identifier fixtures for tests.

use serde_json::json;
use streamshift::event_store::{EventStore, EventToWrite, ExpectedVersion};
use streamshift::errors::EventStoreResult;
use streamshift::types::{EventTypeName, EventVersion, LockKey, ObjectId, StreamId};
use uuid::Uuid;

/// Event type used by [`numbered_events`].
pub const LINE_ADDED: &str = "LineAdded";

/// A `LineAdded` event carrying `line`.
pub fn line_added(line: u64) -> EventToWrite {
    EventToWrite::new(
        EventTypeName::try_new(LINE_ADDED).expect("fixture event type is valid"),
        json!({ "line": line, "sku": format!("SKU-{line:04}") }),
    )
}

/// `count` events numbered from 1.
pub fn numbered_events(count: u64) -> Vec<EventToWrite> {
    (1..=count).map(line_added).collect()
}

/// Stream id unique per call, for tests sharing a backend.
pub fn unique_stream_id(label: &str) -> Result<StreamId, String> {
    StreamId::try_new(format!("{label}-{}", Uuid::now_v7())).map_err(|error| error.to_string())
}

/// Object id unique per call.
pub fn unique_object_id(label: &str) -> Result<ObjectId, String> {
    ObjectId::try_new(format!("{label}-{}", Uuid::now_v7())).map_err(|error| error.to_string())
}

/// Lock key unique per call.
pub fn unique_lock_key(label: &str) -> Result<LockKey, String> {
    LockKey::try_new(format!("{label}:{}", Uuid::now_v7())).map_err(|error| error.to_string())
}

/// Appends `count` numbered events to `stream_id` and returns the new version.
pub async fn seed_stream<S>(store: &S, stream_id: &StreamId, count: u64) -> EventStoreResult<EventVersion>
where
    S: EventStore + ?Sized,
{
    store
        .append(stream_id, ExpectedVersion::Any, numbered_events(count))
        .await
}
