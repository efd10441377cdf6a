//! In-memory adapters for `streamshift`
//!
//! This crate provides in-memory implementations of the storage, lock and
//! book-closing collaborators from the streamshift crate, useful for testing
//! and for single-process deployments where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod book_closing;
mod lock;

pub use book_closing::{InMemoryArchive, InMemoryObjectHistory, InMemorySnapshotStore, SnapshotRecord};
pub use lock::{InMemoryLock, InMemoryLockProvider};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use streamshift::errors::{EventStoreError, EventStoreResult, Operation};
use streamshift::event_store::{EventStore, EventToWrite, ExpectedVersion, ReadOptions, RecordedEvent};
use streamshift::types::{EventVersion, StreamId, Timestamp};
use tracing::debug;

/// Thread-safe in-memory event store.
///
/// A stream whose last event is the closed sentinel refuses further appends.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    // Maps stream IDs to their events; an event's version is its index + 1
    streams: Arc<RwLock<HashMap<StreamId, Vec<RecordedEvent>>>>,
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every stream holding at least one event.
    pub fn stream_ids(&self) -> EventStoreResult<Vec<StreamId>> {
        let streams = self
            .streams
            .read()
            .map_err(|e| poisoned(Operation::Read, &e))?;
        let mut ids: Vec<_> = streams
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(stream_id, _)| stream_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn poisoned(operation: Operation, error: &impl std::fmt::Display) -> EventStoreError {
    EventStoreError::StoreFailure {
        operation,
        detail: format!("Lock poisoned: {error}"),
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> EventStoreResult<EventVersion> {
        let mut streams = self
            .streams
            .write()
            .map_err(|e| poisoned(Operation::Append, &e))?;
        let stream = streams.get(stream_id);
        let current = EventVersion::new(stream.map_or(0, Vec::len) as u64);

        if stream
            .and_then(|events| events.last())
            .is_some_and(RecordedEvent::is_stream_closed)
        {
            return Err(EventStoreError::StreamClosed {
                stream: stream_id.clone(),
                closed_at: current,
            });
        }
        if !expected.matches(current) {
            return Err(EventStoreError::VersionConflict {
                stream: stream_id.clone(),
                expected,
                current,
            });
        }
        // The sentinel must be the last event of its batch.
        if let Some(position) = events.iter().position(EventToWrite::is_stream_closed) {
            if position + 1 < events.len() {
                return Err(EventStoreError::StreamClosed {
                    stream: stream_id.clone(),
                    closed_at: current.advance_by(position as u64 + 1),
                });
            }
        }
        if events.is_empty() {
            return Ok(current);
        }

        let recorded_at = Timestamp::now();
        let stream = streams.entry(stream_id.clone()).or_default();
        let mut version = current;
        for event in events {
            version = version.next();
            stream.push(RecordedEvent {
                event_id: event.event_id,
                stream_id: stream_id.clone(),
                version,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
                metadata: event.metadata,
            });
        }
        debug!(stream = %stream_id, version = %version, "[memory.append] events appended");
        Ok(version)
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<RecordedEvent>> {
        let streams = self
            .streams
            .read()
            .map_err(|e| poisoned(Operation::Read, &e))?;
        let Some(events) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        let mut result = Vec::new();
        for event in events {
            // Apply from_version filter
            if let Some(from_version) = options.from_version {
                if event.version < from_version {
                    continue;
                }
            }

            // Apply to_version filter
            if let Some(to_version) = options.to_version {
                if event.version > to_version {
                    break;
                }
            }

            result.push(event.clone());

            // Apply max_events limit
            if options.max_events.is_some_and(|max| result.len() >= max) {
                break;
            }
        }
        Ok(result)
    }

    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<EventVersion> {
        let streams = self
            .streams
            .read()
            .map_err(|e| poisoned(Operation::StreamVersion, &e))?;
        Ok(EventVersion::new(
            streams.get(stream_id).map_or(0, Vec::len) as u64,
        ))
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> EventStoreResult<()> {
        let removed = self
            .streams
            .write()
            .map_err(|e| poisoned(Operation::DeleteStream, &e))?
            .remove(stream_id);
        debug!(
            stream = %stream_id,
            events = removed.as_ref().map_or(0, Vec::len),
            "[memory.delete] stream deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use streamshift::stream_closed::{ClosureReason, StreamClosedEvent, StreamLocation};
    use streamshift::types::EventTypeName;

    fn stream(name: &str) -> StreamId {
        StreamId::try_new(name).unwrap()
    }

    fn event(n: u64) -> EventToWrite {
        EventToWrite::new(
            EventTypeName::try_new("LineAdded").unwrap(),
            serde_json::json!({ "n": n }),
        )
    }

    fn sentinel(last: u64) -> EventToWrite {
        StreamClosedEvent::new(
            &StreamLocation::stream(stream("orders-v2")),
            ClosureReason::Migration,
            EventVersion::new(last),
        )
        .to_event_to_write()
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store1 = InMemoryEventStore::new();
        #[allow(clippy::redundant_clone)]
        let store2 = store1.clone();

        assert!(Arc::ptr_eq(&store1.streams, &store2.streams));
    }

    #[tokio::test]
    async fn test_missing_stream_reads_empty_at_version_zero() {
        let store = InMemoryEventStore::new();

        assert!(store.read(&stream("nope"), &ReadOptions::new()).await.unwrap().is_empty());
        assert_eq!(
            store.stream_version(&stream("nope")).await.unwrap(),
            EventVersion::initial()
        );
    }

    #[tokio::test]
    async fn test_versions_start_at_one_and_are_contiguous() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");

        let version = store
            .append(&stream_id, ExpectedVersion::NoStream, (1..=3).map(event).collect())
            .await
            .unwrap();

        assert_eq!(version, EventVersion::new(3));
        let events = store.read(&stream_id, &ReadOptions::new()).await.unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version.into_inner()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrency_control() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");
        let _ = store
            .append(&stream_id, ExpectedVersion::NoStream, vec![event(1)])
            .await
            .unwrap();

        let stale = store
            .append(&stream_id, ExpectedVersion::Exact(EventVersion::initial()), vec![event(2)])
            .await;
        assert!(matches!(
            stale,
            Err(EventStoreError::VersionConflict { current, .. }) if current == EventVersion::new(1)
        ));

        let again = store
            .append(&stream_id, ExpectedVersion::NoStream, vec![event(2)])
            .await;
        assert!(matches!(again, Err(EventStoreError::VersionConflict { .. })));

        let ok = store
            .append(&stream_id, ExpectedVersion::Exact(EventVersion::new(1)), vec![event(2)])
            .await
            .unwrap();
        assert_eq!(ok, EventVersion::new(2));
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_appends() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");
        let _ = store
            .append(&stream_id, ExpectedVersion::Any, vec![event(1), event(2)])
            .await
            .unwrap();
        let _ = store
            .append(&stream_id, ExpectedVersion::Exact(EventVersion::new(2)), vec![sentinel(2)])
            .await
            .unwrap();

        let result = store.append(&stream_id, ExpectedVersion::Any, vec![event(3)]).await;

        assert!(matches!(
            result,
            Err(EventStoreError::StreamClosed { closed_at, .. }) if closed_at == EventVersion::new(3)
        ));
        assert_eq!(store.stream_version(&stream_id).await.unwrap(), EventVersion::new(3));
    }

    #[tokio::test]
    async fn test_events_after_sentinel_in_one_batch_are_rejected() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");

        let result = store
            .append(&stream_id, ExpectedVersion::Any, vec![event(1), sentinel(1), event(2)])
            .await;

        assert!(matches!(result, Err(EventStoreError::StreamClosed { .. })));
        assert_eq!(store.stream_version(&stream_id).await.unwrap(), EventVersion::initial());
    }

    #[tokio::test]
    async fn test_delete_removes_the_stream() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");
        let _ = store
            .append(&stream_id, ExpectedVersion::Any, vec![event(1)])
            .await
            .unwrap();

        store.delete_stream(&stream_id).await.unwrap();

        assert_eq!(store.stream_version(&stream_id).await.unwrap(), EventVersion::initial());
        assert!(store.stream_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_options_filtering() {
        let store = InMemoryEventStore::new();
        let stream_id = stream("orders-1");
        let _ = store
            .append(&stream_id, ExpectedVersion::NoStream, (1..=10).map(event).collect())
            .await
            .unwrap();

        let read = |options: ReadOptions| {
            let store = store.clone();
            let stream_id = stream_id.clone();
            async move { store.read(&stream_id, &options).await.unwrap().len() }
        };

        assert_eq!(read(ReadOptions::new().from_version(EventVersion::new(5))).await, 6);
        assert_eq!(read(ReadOptions::new().to_version(EventVersion::new(3))).await, 3);
        assert_eq!(
            read(
                ReadOptions::new()
                    .from_version(EventVersion::new(3))
                    .to_version(EventVersion::new(7))
            )
            .await,
            5
        );
        assert_eq!(read(ReadOptions::new().with_max_events(4)).await, 4);
    }

    proptest! {
        #[test]
        fn version_equals_events_written(batches in prop::collection::vec(0usize..6, 0..10)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryEventStore::new();
                let stream_id = stream("prop");
                let mut total = 0u64;
                for size in batches {
                    let version = store
                        .append(&stream_id, ExpectedVersion::Exact(EventVersion::new(total)), (0..size as u64).map(event).collect())
                        .await
                        .unwrap();
                    total += size as u64;
                    assert_eq!(version, EventVersion::new(total));
                }
                assert_eq!(store.stream_version(&stream_id).await.unwrap(), EventVersion::new(total));
            });
        }
    }
}
