//! Finalization of a stream after cutover.
//!
//! Closing a book always runs in this order:
//!
//! 1. append a [`StreamClosedEvent`] as the stream's last event
//! 2. write a snapshot at the closure version (optional)
//! 3. archive the stream to cold storage (optional)
//! 4. hard-delete the stream's raw data (optional, see below)
//! 5. record a [`TerminatedStream`] in the object's history
//!
//! The sentinel goes first so the stream is closed to writers even when a
//! later step fails or is deferred. Deletion runs only after a successful
//! archive, unless `delete_without_archive` explicitly asks for it.

use crate::errors::{BookClosingError, MigrationResult, ValidationError};
use crate::event_store::{last_event, read_all, EventStore, ExpectedVersion, RecordedEvent};
use crate::stream_closed::{ClosureReason, StreamClosedEvent, StreamLocation};
use crate::types::{EventVersion, MigrationId, ObjectId, StreamId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// What book closing does besides appending the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookClosingConfig {
    /// Write a snapshot at the closure version.
    pub create_snapshot: bool,
    /// Cold-storage location to archive to; `None` skips archiving.
    pub archive_location: Option<String>,
    /// Delete the raw stream once it has been archived.
    pub delete_after_archive: bool,
    /// Delete the raw stream even without an archive. Irreversible.
    pub delete_without_archive: bool,
    /// Reason recorded in the sentinel and the history record.
    pub reason: ClosureReason,
    /// Metadata copied into the sentinel and the history record.
    pub metadata: BTreeMap<String, String>,
}

impl Default for BookClosingConfig {
    fn default() -> Self {
        Self {
            create_snapshot: false,
            archive_location: None,
            delete_after_archive: false,
            delete_without_archive: false,
            reason: ClosureReason::Migration,
            metadata: BTreeMap::new(),
        }
    }
}

impl BookClosingConfig {
    /// Rejects contradictory settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.delete_after_archive && self.archive_location.is_none() {
            return Err(ValidationError::InvalidConfiguration(
                "delete_after_archive requires an archive_location".to_string(),
            ));
        }
        if self
            .archive_location
            .as_deref()
            .is_some_and(|location| location.trim().is_empty())
        {
            return Err(ValidationError::InvalidConfiguration(
                "archive_location must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this configuration deletes data with no archive to fall back on.
    pub const fn deletes_without_archive(&self) -> bool {
        self.delete_without_archive
    }
}

/// Record of a terminated stream, appended to the object's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedStream {
    /// The closed stream
    pub stream_identifier: StreamId,
    /// Version of the last business event
    pub final_version: EventVersion,
    /// When the stream was closed
    pub terminated_at: Timestamp,
    /// Why it was closed
    pub reason: ClosureReason,
    /// Caller supplied metadata
    pub metadata: BTreeMap<String, String>,
}

/// Writes aggregate snapshots. Folding events into state is the writer's concern.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    /// Writes a snapshot of `object_id` as of `version` and returns where it lives.
    async fn write_snapshot(
        &self,
        object_id: &ObjectId,
        stream_id: &StreamId,
        version: EventVersion,
    ) -> Result<String, BookClosingError>;
}

/// Copies closed streams to cold storage.
#[async_trait]
pub trait StreamArchiver: Send + Sync {
    /// Archives every event of `stream_id` to `location`; returns the archived event count.
    async fn archive(
        &self,
        stream_id: &StreamId,
        events: &[RecordedEvent],
        location: &str,
    ) -> Result<u64, BookClosingError>;
}

/// The object's document history.
#[async_trait]
pub trait ObjectHistory: Send + Sync {
    /// Appends a terminated-stream record.
    async fn record_terminated_stream(
        &self,
        object_id: &ObjectId,
        record: TerminatedStream,
    ) -> Result<(), BookClosingError>;
}

/// Outcome of one book-closing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The step ran and succeeded.
    Completed(String),
    /// The step did not run.
    Skipped(String),
    /// The step ran and failed.
    Failed(String),
}

impl StepOutcome {
    /// Whether the step failed.
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether the step completed.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// What a book-closing run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookClosingReport {
    /// The closed stream
    pub stream_id: StreamId,
    /// Version of the sentinel
    pub closed_at_version: EventVersion,
    /// Version of the last business event
    pub last_business_version: EventVersion,
    /// The stream already ended with a sentinel; none was appended
    pub already_closed: bool,
    /// Snapshot step
    pub snapshot: StepOutcome,
    /// Archive step
    pub archive: StepOutcome,
    /// Deletion step
    pub deletion: StepOutcome,
    /// History step
    pub history: StepOutcome,
}

impl BookClosingReport {
    /// Whether no step failed.
    pub const fn is_complete(&self) -> bool {
        !(self.snapshot.is_failed()
            || self.archive.is_failed()
            || self.deletion.is_failed()
            || self.history.is_failed())
    }
}

/// What to close and where its events continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookClosingRequest {
    /// Object owning the stream
    pub object_id: ObjectId,
    /// Stream to close
    pub stream_id: StreamId,
    /// Where readers should continue
    pub continuation: StreamLocation,
    /// Migration performing the closure, if any
    pub migration_id: Option<MigrationId>,
}

/// Runs book closing against an event store and optional collaborators.
pub struct BookCloser<S: ?Sized> {
    store: Arc<S>,
    config: BookClosingConfig,
    snapshots: Option<Arc<dyn SnapshotWriter>>,
    archiver: Option<Arc<dyn StreamArchiver>>,
    history: Option<Arc<dyn ObjectHistory>>,
}

impl<S> BookCloser<S>
where
    S: EventStore + ?Sized,
{
    /// Creates a closer with no collaborators.
    pub fn new(store: Arc<S>, config: BookClosingConfig) -> Self {
        Self {
            store,
            config,
            snapshots: None,
            archiver: None,
            history: None,
        }
    }

    /// Sets the snapshot writer.
    #[must_use]
    pub fn with_snapshot_writer(mut self, writer: Arc<dyn SnapshotWriter>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Sets the archiver.
    #[must_use]
    pub fn with_archiver(mut self, archiver: Arc<dyn StreamArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Sets the object history.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn ObjectHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Closes the stream.
    ///
    /// Re-running on a stream that already ends with a sentinel does not
    /// append a second one; the remaining steps run again.
    #[instrument(skip(self), fields(stream = %request.stream_id))]
    pub async fn close(&self, request: &BookClosingRequest) -> MigrationResult<BookClosingReport> {
        self.config.validate()?;
        if self.config.create_snapshot && self.snapshots.is_none() {
            return Err(ValidationError::InvalidConfiguration(
                "create_snapshot requires a snapshot writer".to_string(),
            )
            .into());
        }
        if self.config.archive_location.is_some() && self.archiver.is_none() {
            return Err(ValidationError::InvalidConfiguration(
                "archive_location requires an archiver".to_string(),
            )
            .into());
        }

        let (closed_at_version, last_business_version, already_closed) =
            self.append_sentinel(request).await?;

        let snapshot = self.snapshot(request, last_business_version).await;
        let archive = self.archive(request).await?;
        let deletion = self.delete(request, &archive).await;
        let history = self.record_history(request, last_business_version).await;

        let report = BookClosingReport {
            stream_id: request.stream_id.clone(),
            closed_at_version,
            last_business_version,
            already_closed,
            snapshot,
            archive,
            deletion,
            history,
        };
        if report.is_complete() {
            info!(
                stream = %request.stream_id,
                closed_at = %closed_at_version,
                "[book_closing.close] stream closed"
            );
        } else {
            warn!(
                stream = %request.stream_id,
                report = ?report,
                "[book_closing.close] stream closed with failed steps"
            );
        }
        Ok(report)
    }

    async fn append_sentinel(
        &self,
        request: &BookClosingRequest,
    ) -> MigrationResult<(EventVersion, EventVersion, bool)> {
        if let Some(last) = last_event(self.store.as_ref(), &request.stream_id).await? {
            if let Some(existing) = StreamClosedEvent::from_recorded(&last)? {
                info!(
                    stream = %request.stream_id,
                    version = %last.version,
                    "[book_closing.close] stream already closed"
                );
                return Ok((last.version, existing.last_business_event_version, true));
            }
        }

        let final_version = self.store.stream_version(&request.stream_id).await?;
        let mut sentinel =
            StreamClosedEvent::new(&request.continuation, self.config.reason, final_version)
                .with_metadata(self.config.metadata.clone());
        if let Some(migration_id) = request.migration_id {
            sentinel = sentinel.with_migration_id(migration_id);
        }

        let closed_at = self
            .store
            .append(
                &request.stream_id,
                ExpectedVersion::Exact(final_version),
                vec![sentinel.to_event_to_write()],
            )
            .await?;
        Ok((closed_at, final_version, false))
    }

    async fn snapshot(&self, request: &BookClosingRequest, version: EventVersion) -> StepOutcome {
        let (true, Some(writer)) = (self.config.create_snapshot, &self.snapshots) else {
            return StepOutcome::Skipped("snapshot not requested".to_string());
        };
        match writer
            .write_snapshot(&request.object_id, &request.stream_id, version)
            .await
        {
            Ok(location) => StepOutcome::Completed(location),
            Err(snapshot_error) => {
                error!(stream = %request.stream_id, error = %snapshot_error, "[book_closing.snapshot] failed");
                StepOutcome::Failed(snapshot_error.to_string())
            }
        }
    }

    async fn archive(&self, request: &BookClosingRequest) -> MigrationResult<StepOutcome> {
        let (Some(location), Some(archiver)) = (&self.config.archive_location, &self.archiver) else {
            return Ok(StepOutcome::Skipped("archive not requested".to_string()));
        };
        let events = read_all(self.store.as_ref(), &request.stream_id).await?;
        Ok(match archiver.archive(&request.stream_id, &events, location).await {
            Ok(count) => StepOutcome::Completed(format!("{count} events archived to {location}")),
            Err(archive_error) => {
                error!(stream = %request.stream_id, error = %archive_error, "[book_closing.archive] failed");
                StepOutcome::Failed(archive_error.to_string())
            }
        })
    }

    async fn delete(&self, request: &BookClosingRequest, archive: &StepOutcome) -> StepOutcome {
        let allowed = if self.config.delete_without_archive {
            warn!(stream = %request.stream_id, "[book_closing.delete] deleting without relying on an archive");
            true
        } else if self.config.delete_after_archive {
            archive.is_completed()
        } else {
            return StepOutcome::Skipped("deletion not requested".to_string());
        };
        if !allowed {
            return StepOutcome::Skipped("archive did not complete".to_string());
        }
        match self.store.delete_stream(&request.stream_id).await {
            Ok(()) => StepOutcome::Completed("raw stream deleted".to_string()),
            Err(delete_error) => {
                error!(stream = %request.stream_id, error = %delete_error, "[book_closing.delete] failed");
                StepOutcome::Failed(delete_error.to_string())
            }
        }
    }

    async fn record_history(
        &self,
        request: &BookClosingRequest,
        final_version: EventVersion,
    ) -> StepOutcome {
        let Some(history) = &self.history else {
            return StepOutcome::Skipped("no object history configured".to_string());
        };
        let record = TerminatedStream {
            stream_identifier: request.stream_id.clone(),
            final_version,
            terminated_at: Timestamp::now(),
            reason: self.config.reason,
            metadata: self.config.metadata.clone(),
        };
        match history.record_terminated_stream(&request.object_id, record).await {
            Ok(()) => StepOutcome::Completed("terminated stream recorded".to_string()),
            Err(history_error) => {
                error!(object_id = %request.object_id, error = %history_error, "[book_closing.history] failed");
                StepOutcome::Failed(history_error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{EventStoreError, EventStoreResult};
    use crate::event_store::{EventToWrite, ReadOptions};
    use crate::types::EventTypeName;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Store {
        streams: Mutex<HashMap<StreamId, Vec<RecordedEvent>>>,
        deletes: Mutex<Vec<StreamId>>,
    }

    #[async_trait]
    impl EventStore for Store {
        async fn append(
            &self,
            stream_id: &StreamId,
            expected: ExpectedVersion,
            events: Vec<EventToWrite>,
        ) -> EventStoreResult<EventVersion> {
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

        async fn read(&self, stream_id: &StreamId, options: &ReadOptions) -> EventStoreResult<Vec<RecordedEvent>> {
            let events = self.streams.lock().unwrap().get(stream_id).cloned().unwrap_or_default();
            Ok(events
                .into_iter()
                .filter(|event| options.from_version.map_or(true, |from| event.version >= from))
                .filter(|event| options.to_version.map_or(true, |to| event.version <= to))
                .collect())
        }

        async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<EventVersion> {
            Ok(EventVersion::new(
                self.streams.lock().unwrap().get(stream_id).map_or(0, Vec::len) as u64,
            ))
        }

        async fn delete_stream(&self, stream_id: &StreamId) -> EventStoreResult<()> {
            let _ = self.streams.lock().unwrap().remove(stream_id);
            self.deletes.lock().unwrap().push(stream_id.clone());
            Ok(())
        }
    }

    struct Archiver {
        fail: bool,
    }

    #[async_trait]
    impl StreamArchiver for Archiver {
        async fn archive(&self, _: &StreamId, events: &[RecordedEvent], _: &str) -> Result<u64, BookClosingError> {
            if self.fail {
                Err(BookClosingError::Archive("bucket unavailable".to_string()))
            } else {
                Ok(events.len() as u64)
            }
        }
    }

    #[derive(Default)]
    struct History(Mutex<Vec<TerminatedStream>>);

    #[async_trait]
    impl ObjectHistory for History {
        async fn record_terminated_stream(&self, _: &ObjectId, record: TerminatedStream) -> Result<(), BookClosingError> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn old() -> StreamId {
        StreamId::try_new("orders-1").unwrap()
    }

    fn request() -> BookClosingRequest {
        BookClosingRequest {
            object_id: ObjectId::try_new("order-1").unwrap(),
            stream_id: old(),
            continuation: StreamLocation::stream(StreamId::try_new("orders-1-v2").unwrap()),
            migration_id: Some(MigrationId::new()),
        }
    }

    async fn store_with(count: usize) -> Arc<Store> {
        let store = Arc::new(Store::default());
        let events = (0..count)
            .map(|_| EventToWrite::new(EventTypeName::try_new("ItemAdded").unwrap(), serde_json::json!({})))
            .collect();
        let _ = store.append(&old(), ExpectedVersion::NoStream, events).await.unwrap();
        store
    }

    #[test]
    fn delete_after_archive_needs_a_location() {
        let config = BookClosingConfig {
            delete_after_archive: true,
            ..BookClosingConfig::default()
        };
        assert!(config.validate().is_err());
        let config = BookClosingConfig {
            archive_location: Some("s3://cold/orders".to_string()),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn sentinel_is_appended_after_last_business_event() {
        let store = store_with(3).await;
        let history = Arc::new(History::default());
        let closer = BookCloser::new(Arc::clone(&store), BookClosingConfig::default())
            .with_history(history.clone());

        let report = closer.close(&request()).await.unwrap();

        assert_eq!(report.closed_at_version, EventVersion::new(4));
        assert_eq!(report.last_business_version, EventVersion::new(3));
        assert!(report.is_complete());
        let events = store.read(&old(), &ReadOptions::new()).await.unwrap();
        let sentinel = StreamClosedEvent::from_recorded(events.last().unwrap()).unwrap().unwrap();
        assert_eq!(sentinel.continuation_stream_id.as_ref(), "orders-1-v2");
        assert_eq!(history.0.lock().unwrap()[0].final_version, EventVersion::new(3));

        let rejected = store
            .append(&old(), ExpectedVersion::Any, vec![EventToWrite::new(EventTypeName::try_new("Late").unwrap(), serde_json::json!({}))])
            .await;
        assert!(matches!(rejected, Err(EventStoreError::StreamClosed { .. })));
    }

    #[tokio::test]
    async fn rerun_does_not_append_a_second_sentinel() {
        let store = store_with(2).await;
        let closer = BookCloser::new(Arc::clone(&store), BookClosingConfig::default());
        let _ = closer.close(&request()).await.unwrap();

        let report = closer.close(&request()).await.unwrap();
        assert!(report.already_closed);
        assert_eq!(report.last_business_version, EventVersion::new(2));
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(3));
    }

    #[tokio::test]
    async fn archive_failure_keeps_stream_and_skips_deletion() {
        let store = store_with(2).await;
        let config = BookClosingConfig {
            archive_location: Some("s3://cold/orders".to_string()),
            delete_after_archive: true,
            ..BookClosingConfig::default()
        };
        let closer = BookCloser::new(Arc::clone(&store), config)
            .with_archiver(Arc::new(Archiver { fail: true }));

        let report = closer.close(&request()).await.unwrap();

        assert!(report.archive.is_failed());
        assert!(matches!(report.deletion, StepOutcome::Skipped(_)));
        assert!(!report.is_complete());
        assert!(store.deletes.lock().unwrap().is_empty());
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(3));
    }

    #[tokio::test]
    async fn successful_archive_then_delete() {
        let store = store_with(2).await;
        let config = BookClosingConfig {
            archive_location: Some("s3://cold/orders".to_string()),
            delete_after_archive: true,
            ..BookClosingConfig::default()
        };
        let closer = BookCloser::new(Arc::clone(&store), config)
            .with_archiver(Arc::new(Archiver { fail: false }));

        let report = closer.close(&request()).await.unwrap();

        assert_eq!(report.archive, StepOutcome::Completed("3 events archived to s3://cold/orders".to_string()));
        assert!(report.deletion.is_completed());
        assert_eq!(store.deletes.lock().unwrap().as_slice(), &[old()]);
    }

    #[tokio::test]
    async fn snapshot_without_writer_is_rejected_before_any_change() {
        let store = store_with(1).await;
        let config = BookClosingConfig {
            create_snapshot: true,
            ..BookClosingConfig::default()
        };
        let result = BookCloser::new(Arc::clone(&store), config).close(&request()).await;

        assert!(result.is_err());
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(1));
    }
}
