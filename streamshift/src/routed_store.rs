//! Application-facing event store that follows the published routing.
//!
//! Ordinary traffic never takes the migration lock. Every call resolves the
//! object's current [`StreamRouting`](crate::routing::StreamRouting) from the
//! routing table and targets whatever streams it names.
//!
//! Writes go to the primary stream first and are awaited. In `DualWrite` the
//! same events are then mirrored to the new stream through the transformer;
//! in `DualRead` they are mirrored to the old stream unchanged, tagged with
//! [`MIRRORED_FROM_METADATA_KEY`] so verification and later copies do not
//! transform them a second time. Mirror writes
//! use `ExpectedVersion::Exact(primary_version - n)` so both streams keep
//! version alignment. A failed mirror never fails the caller: it is logged
//! and recorded in the [`ReconciliationQueue`].
//!
//! A closed stream redirects on its own: an append rejected with
//! `StreamClosed`, or a read that ends at the closing sentinel, is retried on
//! the sentinel's continuation stream. Old and new stream versions are
//! aligned, so the caller's expected version and read range carry over.

use crate::errors::{EventStoreError, MigrationError, MigrationResult};
use crate::event_store::{
    last_event, EventStore, EventToWrite, ExpectedVersion, ReadOptions, RecordedEvent,
    MIRRORED_FROM_METADATA_KEY,
};
use crate::reconciliation::{PendingSecondaryWrite, ReconciliationQueue};
use crate::routing::{MigrationPhase, StreamRouting};
use crate::routing_table::{routing_for, RoutingTable};
use crate::stream_closed::StreamClosedEvent;
use crate::transformer::EventTransformer;
use crate::types::{EventVersion, ObjectId, StreamId, Timestamp};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Closed streams followed per call before giving up.
const MAX_CONTINUATION_HOPS: usize = 8;

/// What happened to the mirror copy of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorStatus {
    /// The phase has no secondary write target.
    NotRequired,
    /// The secondary stream accepted the events.
    Mirrored(StreamId),
    /// The secondary write failed and was queued for reconciliation.
    Deferred(StreamId),
    /// The events could not be transformed; the backfill copy will retry them.
    TransformFailed(StreamId),
}

/// Result of a routed append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Stream that received the authoritative write
    pub stream_id: StreamId,
    /// Its version after the write
    pub version: EventVersion,
    /// Phase the write was routed under
    pub phase: MigrationPhase,
    /// What happened to the mirror copy
    pub mirror: MirrorStatus,
}

/// Event store facade applying migration routing on every call.
///
/// Once the new stream is primary, applications are expected to write events
/// in the new stream's representation.
pub struct RoutedEventStore<S: ?Sized> {
    store: Arc<S>,
    table: Arc<dyn RoutingTable>,
    transformer: Arc<dyn EventTransformer>,
    reconciliation: Arc<ReconciliationQueue>,
}

impl<S> RoutedEventStore<S>
where
    S: EventStore + ?Sized,
{
    /// Creates the facade.
    pub fn new(
        store: Arc<S>,
        table: Arc<dyn RoutingTable>,
        transformer: Arc<dyn EventTransformer>,
        reconciliation: Arc<ReconciliationQueue>,
    ) -> Self {
        Self {
            store,
            table,
            transformer,
            reconciliation,
        }
    }

    /// The queue collecting failed mirror writes.
    pub fn reconciliation(&self) -> &Arc<ReconciliationQueue> {
        &self.reconciliation
    }

    /// Current routing for an object.
    pub async fn routing(
        &self,
        object_id: &ObjectId,
        default_stream: &StreamId,
    ) -> MigrationResult<StreamRouting> {
        Ok(routing_for(self.table.as_ref(), object_id, default_stream).await?)
    }

    /// Appends events for an object.
    ///
    /// `expected` applies to the primary write stream. Only a primary failure
    /// is returned as an error.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn append(
        &self,
        object_id: &ObjectId,
        default_stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> MigrationResult<AppendOutcome> {
        let routing = self.routing(object_id, default_stream).await?;
        let primary = routing.primary_write().clone();
        let count = events.len() as u64;

        let (written_to, version) = self.append_following(&primary, expected, &events).await?;
        if written_to != primary {
            return Ok(AppendOutcome {
                stream_id: written_to,
                version,
                phase: routing.phase(),
                mirror: MirrorStatus::NotRequired,
            });
        }

        let mirror = match routing.secondary_write() {
            None => MirrorStatus::NotRequired,
            Some(secondary) => {
                let base = EventVersion::new(version.into_inner().saturating_sub(count));
                let mirrored = if routing.phase() == MigrationPhase::DualWrite {
                    match self.transform_mirror(&primary, base, events).await {
                        Ok(transformed) => transformed,
                        Err(transform_error) => {
                            warn!(
                                object_id = %object_id,
                                stream = %secondary,
                                error = %transform_error,
                                "[routed_store.append] could not transform mirror write, leaving it to backfill"
                            );
                            return Ok(AppendOutcome {
                                stream_id: primary,
                                version,
                                phase: routing.phase(),
                                mirror: MirrorStatus::TransformFailed(secondary.clone()),
                            });
                        }
                    }
                } else {
                    events
                        .into_iter()
                        .map(|event| event.with_metadata(MIRRORED_FROM_METADATA_KEY, primary.to_string()))
                        .collect()
                };
                self.mirror(secondary, base, mirrored).await
            }
        };

        Ok(AppendOutcome {
            stream_id: primary,
            version,
            phase: routing.phase(),
            mirror,
        })
    }

    /// Reads an object's events.
    ///
    /// In `DualRead` an empty result from the new stream falls back to the
    /// old stream for the same range.
    #[instrument(skip(self))]
    pub async fn read(
        &self,
        object_id: &ObjectId,
        default_stream: &StreamId,
        options: &ReadOptions,
    ) -> MigrationResult<Vec<RecordedEvent>> {
        let routing = self.routing(object_id, default_stream).await?;
        let events = self.read_following(routing.primary_read(), options).await?;
        if !events.is_empty() {
            return Ok(events);
        }
        match routing.secondary_read() {
            Some(fallback) => {
                debug!(
                    object_id = %object_id,
                    stream = %fallback,
                    "[routed_store.read] primary returned nothing, reading fallback"
                );
                Ok(self.store.read(fallback, options).await?)
            }
            None => Ok(events),
        }
    }

    /// Appends to `stream_id`, or to the stream continuing it when it is closed.
    async fn append_following(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: &[EventToWrite],
    ) -> MigrationResult<(StreamId, EventVersion)> {
        let mut target = stream_id.clone();
        for _ in 0..=MAX_CONTINUATION_HOPS {
            match self.store.append(&target, expected, events.to_vec()).await {
                Ok(version) => return Ok((target, version)),
                Err(closed @ EventStoreError::StreamClosed { .. }) => {
                    let Some(continuation) = self.continuation_of(&target).await? else {
                        return Err(closed.into());
                    };
                    info!(
                        closed = %target,
                        continuation = %continuation,
                        "[routed_store.append] stream closed, following continuation"
                    );
                    target = continuation;
                }
                Err(append_error) => return Err(append_error.into()),
            }
        }
        Err(EventStoreError::StreamClosed {
            stream: target.clone(),
            closed_at: self.store.stream_version(&target).await?,
        }
        .into())
    }

    /// Reads `stream_id`; a result ending at a closing sentinel is served
    /// from the continuation stream instead.
    async fn read_following(
        &self,
        stream_id: &StreamId,
        options: &ReadOptions,
    ) -> MigrationResult<Vec<RecordedEvent>> {
        let mut events = self.store.read(stream_id, options).await?;
        for _ in 0..MAX_CONTINUATION_HOPS {
            let Some(sentinel) = events.last().filter(|event| event.is_stream_closed()) else {
                break;
            };
            let Some(closed) = StreamClosedEvent::from_recorded(sentinel)? else {
                break;
            };
            debug!(
                closed = %sentinel.stream_id,
                continuation = %closed.continuation_stream_id,
                "[routed_store.read] stream closed, reading continuation"
            );
            events = self.store.read(&closed.continuation_stream_id, options).await?;
        }
        Ok(events)
    }

    async fn continuation_of(&self, stream_id: &StreamId) -> MigrationResult<Option<StreamId>> {
        let Some(last) = last_event(self.store.as_ref(), stream_id).await? else {
            return Ok(None);
        };
        Ok(StreamClosedEvent::from_recorded(&last)?.map(|closed| closed.continuation_stream_id))
    }

    async fn transform_mirror(
        &self,
        source: &StreamId,
        base: EventVersion,
        events: Vec<EventToWrite>,
    ) -> MigrationResult<Vec<EventToWrite>> {
        let recorded_at = Timestamp::now();
        let mut transformed = Vec::with_capacity(events.len());
        let mut version = base;
        for event in events {
            version = version.next();
            let recorded = RecordedEvent {
                event_id: event.event_id,
                stream_id: source.clone(),
                version,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
                metadata: event.metadata,
            };
            let output = self
                .transformer
                .transform(&recorded)
                .await
                .map_err(|source_error| MigrationError::Transform {
                    stream: source.clone(),
                    version,
                    source: source_error,
                })?;
            transformed.push(output);
        }
        Ok(transformed)
    }

    async fn mirror(
        &self,
        secondary: &StreamId,
        base: EventVersion,
        events: Vec<EventToWrite>,
    ) -> MirrorStatus {
        let expected = ExpectedVersion::Exact(base);
        match self.store.append(secondary, expected, events.clone()).await {
            Ok(_) => MirrorStatus::Mirrored(secondary.clone()),
            Err(mirror_error) => {
                warn!(
                    stream = %secondary,
                    expected = %expected,
                    error = %mirror_error,
                    "[routed_store.mirror] secondary write failed"
                );
                self.reconciliation.record(PendingSecondaryWrite::new(
                    secondary.clone(),
                    expected,
                    events,
                    &mirror_error,
                ));
                MirrorStatus::Deferred(secondary.clone())
            }
        }
    }
}
