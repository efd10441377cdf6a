//! In-memory book-closing collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use streamshift::book_closing::{ObjectHistory, SnapshotWriter, StreamArchiver, TerminatedStream};
use streamshift::errors::BookClosingError;
use streamshift::event_store::RecordedEvent;
use streamshift::types::{EventVersion, ObjectId, StreamId};
use tracing::debug;

/// Archive keeping copies of closed streams, keyed by location and stream.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArchive {
    archives: Arc<RwLock<HashMap<(String, StreamId), Vec<RecordedEvent>>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryArchive {
    /// Creates an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `archive` call fail, or succeed again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Events archived for `stream_id` at `location`.
    pub fn archived(&self, location: &str, stream_id: &StreamId) -> Option<Vec<RecordedEvent>> {
        self.archives
            .read()
            .get(&(location.to_string(), stream_id.clone()))
            .cloned()
    }
}

#[async_trait]
impl StreamArchiver for InMemoryArchive {
    async fn archive(
        &self,
        stream_id: &StreamId,
        events: &[RecordedEvent],
        location: &str,
    ) -> Result<u64, BookClosingError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(BookClosingError::Archive(format!(
                "archive location '{location}' is unavailable"
            )));
        }
        let _ = self
            .archives
            .write()
            .insert((location.to_string(), stream_id.clone()), events.to_vec());
        debug!(stream = %stream_id, location, events = events.len(), "[memory.archive] stream archived");
        Ok(events.len() as u64)
    }
}

/// A snapshot written by [`InMemorySnapshotStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Object the snapshot belongs to
    pub object_id: ObjectId,
    /// Stream the snapshot was taken from
    pub stream_id: StreamId,
    /// Last business version folded into the snapshot
    pub version: EventVersion,
}

/// Records snapshot requests; folding state is left to real implementations.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<String, SnapshotRecord>>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty snapshot store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot stored under `snapshot_id`.
    pub fn get(&self, snapshot_id: &str) -> Option<SnapshotRecord> {
        self.snapshots.read().get(snapshot_id).cloned()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether no snapshot was written.
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl SnapshotWriter for InMemorySnapshotStore {
    async fn write_snapshot(
        &self,
        object_id: &ObjectId,
        stream_id: &StreamId,
        version: EventVersion,
    ) -> Result<String, BookClosingError> {
        let snapshot_id = format!("{object_id}/{stream_id}@{version}");
        let _ = self.snapshots.write().insert(
            snapshot_id.clone(),
            SnapshotRecord {
                object_id: object_id.clone(),
                stream_id: stream_id.clone(),
                version,
            },
        );
        Ok(snapshot_id)
    }
}

/// Per-object list of terminated streams.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectHistory {
    records: Arc<RwLock<HashMap<ObjectId, Vec<TerminatedStream>>>>,
}

impl InMemoryObjectHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminated streams recorded for `object_id`, oldest first.
    pub fn terminated_streams(&self, object_id: &ObjectId) -> Vec<TerminatedStream> {
        self.records.read().get(object_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ObjectHistory for InMemoryObjectHistory {
    async fn record_terminated_stream(
        &self,
        object_id: &ObjectId,
        record: TerminatedStream,
    ) -> Result<(), BookClosingError> {
        self.records
            .write()
            .entry(object_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use streamshift::stream_closed::ClosureReason;
    use streamshift::types::Timestamp;

    fn stream() -> StreamId {
        StreamId::try_new("orders-v1-1").unwrap()
    }

    fn object() -> ObjectId {
        ObjectId::try_new("order-1").unwrap()
    }

    #[tokio::test]
    async fn unavailable_archive_refuses_and_stores_nothing() {
        let archive = InMemoryArchive::new();
        archive.set_unavailable(true);

        let result = archive.archive(&stream(), &[], "cold").await;

        assert!(matches!(result, Err(BookClosingError::Archive(_))));
        assert!(archive.archived("cold", &stream()).is_none());

        archive.set_unavailable(false);
        assert_eq!(archive.archive(&stream(), &[], "cold").await.unwrap(), 0);
        assert_eq!(archive.archived("cold", &stream()), Some(Vec::new()));
    }

    #[tokio::test]
    async fn snapshot_ids_identify_stream_and_version() {
        let snapshots = InMemorySnapshotStore::new();

        let id = snapshots
            .write_snapshot(&object(), &stream(), EventVersion::new(42))
            .await
            .unwrap();

        assert_eq!(id, "order-1/orders-v1-1@42");
        assert_eq!(snapshots.get(&id).unwrap().version, EventVersion::new(42));
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn history_keeps_records_in_order() {
        let history = InMemoryObjectHistory::new();
        for version in [3, 9] {
            history
                .record_terminated_stream(
                    &object(),
                    TerminatedStream {
                        stream_identifier: stream(),
                        final_version: EventVersion::new(version),
                        terminated_at: Timestamp::now(),
                        reason: ClosureReason::Migration,
                        metadata: BTreeMap::new(),
                    },
                )
                .await
                .unwrap();
        }

        let versions: Vec<_> = history
            .terminated_streams(&object())
            .into_iter()
            .map(|record| record.final_version.into_inner())
            .collect();
        assert_eq!(versions, vec![3, 9]);
    }
}
