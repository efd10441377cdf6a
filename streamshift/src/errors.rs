//! Error types for streamshift.
//!
//! Errors are reserved for failures and invalid arguments. Expected outcomes of
//! a migration (lock contention, an infeasible plan, a failed verification, a
//! stale checkpoint) are returned as values by the components that produce
//! them, never as errors.
//!
//! # Error Categories
//!
//! - **EventStoreError**: Storage adapter failures
//! - **LockError**: Lock provider backend failures
//! - **RoutingError**: Routing table failures and illegal phase transitions
//! - **TransformError**: An event could not be transformed to the target shape
//! - **ValidationError**: Invalid arguments or configuration
//! - **BookClosingError**: Snapshot, archive or history collaborator failures
//! - **MigrationError**: Umbrella error for the orchestrator API

use crate::event_store::ExpectedVersion;
use crate::routing::MigrationPhase;
use crate::types::{EventVersion, ObjectId, StreamId};
use thiserror::Error;

/// Identifies the event store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Appending events to a stream.
    Append,
    /// Reading events from a stream.
    Read,
    /// Reading the current version of a stream.
    StreamVersion,
    /// Hard-deleting a stream.
    DeleteStream,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Append => write!(f, "append"),
            Self::Read => write!(f, "read"),
            Self::StreamVersion => write!(f, "stream_version"),
            Self::DeleteStream => write!(f, "delete_stream"),
        }
    }
}

/// Errors returned by storage adapters.
///
/// # Common Scenarios
///
/// - **VersionConflict**: Another writer appended first, re-read and retry
/// - **StreamClosed**: The stream was terminated by book closing; follow the
///   `StreamClosedEvent` to its continuation
/// - **StoreFailure**: Infrastructure problem in the backend
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The stream's current version did not match the writer's expectation.
    #[error("Version conflict on stream '{stream}': expected {expected}, but current is {current}")]
    VersionConflict {
        /// The stream with the version conflict
        stream: StreamId,
        /// The version that was expected
        expected: ExpectedVersion,
        /// The actual current version
        current: EventVersion,
    },

    /// The stream ends with a `StreamClosedEvent` and accepts no further appends.
    #[error("Stream '{stream}' is closed at version {closed_at}")]
    StreamClosed {
        /// The closed stream
        stream: StreamId,
        /// Version of the closing sentinel
        closed_at: EventVersion,
    },

    /// An event payload could not be encoded or decoded.
    #[error("Serialization failed for stream '{stream}': {detail}")]
    SerializationFailed {
        /// The stream being written or read
        stream: StreamId,
        /// What went wrong
        detail: String,
    },

    /// The backing store failed for infrastructure reasons.
    #[error("{operation} operation failed: {detail}")]
    StoreFailure {
        /// The operation that failed
        operation: Operation,
        /// Backend-specific detail
        detail: String,
    },

    /// The operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl EventStoreError {
    /// Whether retrying the same operation later could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::StoreFailure { .. } | Self::Timeout(_)
        )
    }
}

/// Errors returned by lock providers.
///
/// Lock contention is not an error: `acquire_lock` returns `None` instead.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// The lease backend could not be reached or answered unexpectedly.
    #[error("Lock backend failure: {0}")]
    Backend(String),

    /// The backend did not answer in time.
    #[error("Lock operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The provider was configured with unusable settings.
    #[error("Invalid lock configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors returned by the migration routing table.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// A transition would skip a phase or move backwards.
    #[error("Invalid phase transition for '{object_id}': {from} -> {to}")]
    InvalidTransition {
        /// The object being migrated
        object_id: ObjectId,
        /// Phase currently persisted
        from: MigrationPhase,
        /// Phase that was requested
        to: MigrationPhase,
    },

    /// Compare-and-set on the persisted phase failed.
    #[error("Routing entry for '{object_id}' changed concurrently: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// The object being migrated
        object_id: ObjectId,
        /// Phase the writer expected to replace
        expected: Option<MigrationPhase>,
        /// Phase actually persisted
        actual: Option<MigrationPhase>,
    },

    /// The backing table failed.
    #[error("Routing table backend failure: {0}")]
    Backend(String),
}

/// Errors raised by an [`EventTransformer`](crate::transformer::EventTransformer).
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// The transformer has no mapping for this event type.
    #[error("Unsupported event type '{0}'")]
    UnsupportedEventType(String),

    /// The payload could not be converted.
    #[error("Transformation failed: {0}")]
    Failed(String),
}

/// Errors for invalid arguments and configuration.
///
/// These signal programmer or operator mistakes and are raised before any
/// side effect takes place.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// An identifier failed its smart-constructor validation.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The input did not have the expected format.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors raised by book-closing collaborators.
///
/// These never fail a book-closing run; they are recorded per step in the
/// report.
#[derive(Debug, Clone, Error)]
pub enum BookClosingError {
    /// Writing the closure snapshot failed.
    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    /// Copying the stream to cold storage failed.
    #[error("Archive failed: {0}")]
    Archive(String),

    /// Recording the terminated stream in the object's history failed.
    #[error("History update failed: {0}")]
    History(String),
}

/// Umbrella error for the migration engine's programmatic API.
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// A storage adapter failed.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The lock provider failed.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The routing table failed or refused a transition.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Copying an event to the target stream failed.
    #[error("Transform error at version {version} of '{stream}': {source}")]
    Transform {
        /// Source stream
        stream: StreamId,
        /// Version of the event that failed
        version: EventVersion,
        /// The transformer's error
        source: TransformError,
    },

    /// Invalid arguments or configuration.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The persisted routing entry belongs to a different migration.
    #[error("Routing conflict for '{object_id}': {detail}")]
    RoutingConflict {
        /// The object being migrated
        object_id: ObjectId,
        /// What did not match
        detail: String,
    },

    /// The operation requires the object to be in another phase.
    #[error("Object '{object_id}' is in phase {actual}, operation requires {required}")]
    InvalidPhase {
        /// The object being migrated
        object_id: ObjectId,
        /// Minimum phase required
        required: MigrationPhase,
        /// Phase found in the routing table
        actual: MigrationPhase,
    },

    /// The routing entry is the only redirect left for a deleted stream.
    #[error("Routing entry for '{object_id}' still redirects deleted stream '{old_stream}'")]
    RedirectStillNeeded {
        /// The migrated object
        object_id: ObjectId,
        /// Stream deleted by book closing
        old_stream: StreamId,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Type alias for event store results.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Type alias for lock provider results.
pub type LockResult<T> = Result<T, LockError>;

/// Type alias for routing table results.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Type alias for migration engine results.
pub type MigrationResult<T> = Result<T, MigrationError>;
