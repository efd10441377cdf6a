//! `StreamShift` - zero-downtime migration of event streams
//!
//! Moves an object's append-only event stream to a new stream, possibly in
//! a new shape, while the application keeps reading and writing it. A
//! migration walks through ordered phases:
//!
//! ```text
//! Normal -> DualWrite -> DualRead -> Cutover -> BookClosed
//! ```
//!
//! - [`routing`] decides which stream(s) a read or write targets per phase
//! - [`routing_table`] persists one entry per migrating object
//! - [`routed_store`] applies that routing to application traffic, mirroring
//!   writes and queueing failed mirrors on a [`reconciliation`] queue
//! - [`orchestrator`] drives the phases under a distributed [`lock`],
//!   backfilling, verifying and finally closing the old stream
//! - [`planner`] dry-runs a migration, [`verification`] checks the copy,
//!   [`book_closing`] terminates the old stream with a [`stream_closed`]
//!   sentinel, and [`checkpoint`] guards decisions against stale reads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod book_closing;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod event_store;
pub mod lock;
pub mod orchestrator;
pub mod planner;
pub mod reconciliation;
pub mod routed_store;
pub mod routing;
pub mod routing_table;
pub mod stream_closed;
pub mod transformer;
pub mod types;
pub mod verification;

#[cfg(test)]
mod testing;

pub use book_closing::{
    BookCloser, BookClosingConfig, BookClosingReport, BookClosingRequest, ObjectHistory,
    SnapshotWriter, StepOutcome, StreamArchiver, TerminatedStream,
};
pub use checkpoint::{Checkpoint, CheckpointValidation, CheckpointValidator, SkipReason};
pub use config::{MigrationConfig, RetryConfig};
pub use errors::{
    BookClosingError, EventStoreError, EventStoreResult, LockError, LockResult, MigrationError,
    MigrationResult, RoutingError, RoutingResult, TransformError, ValidationError,
};
pub use event_store::{EventStore, EventToWrite, ExpectedVersion, ReadOptions, RecordedEvent};
pub use lock::{
    DistributedLock, HeartbeatConfig, LockHeartbeat, LockInfo, LockProvider, NoOpLockProvider,
    ReleaseOutcome,
};
pub use orchestrator::{AbortReason, CutoverOrchestrator, MigrationOutcome, MigrationRequest};
pub use planner::{MigrationPlan, MigrationPlanner, PlanRequest, PlannerConfig, Prerequisite};
pub use reconciliation::{PendingSecondaryWrite, ReconciliationQueue, ReconciliationReport};
pub use routed_store::{AppendOutcome, MirrorStatus, RoutedEventStore};
pub use routing::{route_for, MigrationPhase, StreamRouting};
pub use routing_table::{InMemoryRoutingTable, MigrationRoutingEntry, RoutingTable};
pub use stream_closed::{ClosureReason, StreamClosedEvent, StreamLocation, STREAM_CLOSED_EVENT_TYPE};
pub use transformer::{EventTransformer, FnTransformer, IdentityTransformer};
pub use types::{
    EventId, EventTypeName, EventVersion, LockId, LockKey, MigrationId, ObjectId, PlanId, StreamId,
    Timestamp,
};
pub use verification::{VerificationConfig, VerificationResult, Verifier};
