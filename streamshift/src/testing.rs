//! In-crate test doubles.

use crate::errors::{EventStoreError, EventStoreResult, Operation};
use crate::event_store::{EventStore, EventToWrite, ExpectedVersion, ReadOptions, RecordedEvent};
use crate::types::{EventTypeName, EventVersion, StreamId, Timestamp};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Vec-backed store honouring the closed-stream rule, with per-stream write failures.
#[derive(Default)]
pub struct VecEventStore {
    streams: Mutex<HashMap<StreamId, Vec<RecordedEvent>>>,
    failing: Mutex<HashSet<StreamId>>,
}

impl VecEventStore {
    pub fn fail_writes_to(&self, stream_id: &StreamId) {
        let _ = self.failing.lock().unwrap().insert(stream_id.clone());
    }

    pub async fn seed(&self, stream_id: &StreamId, count: u64) {
        let events = (1..=count)
            .map(|n| {
                EventToWrite::new(
                    EventTypeName::try_new("ItemAdded").unwrap(),
                    serde_json::json!({ "line": n }),
                )
            })
            .collect();
        let _ = self
            .append(stream_id, ExpectedVersion::Any, events)
            .await
            .unwrap();
    }
}

#[async_trait]
impl EventStore for VecEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> EventStoreResult<EventVersion> {
        if self.failing.lock().unwrap().contains(stream_id) {
            return Err(EventStoreError::StoreFailure {
                operation: Operation::Append,
                detail: "injected failure".to_string(),
            });
        }
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(stream_id.clone()).or_default();
        let current = EventVersion::new(stream.len() as u64);
        if stream.last().is_some_and(RecordedEvent::is_stream_closed) {
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
        for event in events {
            stream.push(RecordedEvent {
                event_id: event.event_id,
                stream_id: stream_id.clone(),
                version: EventVersion::new(stream.len() as u64 + 1),
                event_type: event.event_type,
                payload: event.payload,
                recorded_at: Timestamp::now(),
                metadata: event.metadata,
            });
        }
        Ok(EventVersion::new(stream.len() as u64))
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<RecordedEvent>> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| options.from_version.map_or(true, |from| e.version >= from))
                    .filter(|e| options.to_version.map_or(true, |to| e.version <= to))
                    .take(options.max_events.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<EventVersion> {
        Ok(EventVersion::new(
            self.streams
                .lock()
                .unwrap()
                .get(stream_id)
                .map_or(0, Vec::len) as u64,
        ))
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> EventStoreResult<()> {
        let _ = self.streams.lock().unwrap().remove(stream_id);
        Ok(())
    }
}
