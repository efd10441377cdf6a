//! Migration phases and the pure routing decision.
//!
//! [`route_for`] maps a phase plus the old and new stream to the stream(s)
//! reads and writes must target. It is cheap and lock-free so ordinary
//! application traffic can consult it on every call.

use crate::types::StreamId;
use serde::{Deserialize, Serialize};

/// Phase of a stream migration.
///
/// Phases are strictly ordered and only ever move forward one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// No migration in progress; the old stream is authoritative.
    Normal,
    /// Writes go to old then new; reads use old.
    DualWrite,
    /// Reads and writes use new; reads fall back to old on a miss.
    DualRead,
    /// The new stream is authoritative for reads and writes.
    Cutover,
    /// The old stream has been terminated.
    BookClosed,
}

impl MigrationPhase {
    /// All phases in order.
    pub const ALL: [Self; 5] = [
        Self::Normal,
        Self::DualWrite,
        Self::DualRead,
        Self::Cutover,
        Self::BookClosed,
    ];

    /// The phase following this one, `None` for `BookClosed`.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Normal => Some(Self::DualWrite),
            Self::DualWrite => Some(Self::DualRead),
            Self::DualRead => Some(Self::Cutover),
            Self::Cutover => Some(Self::BookClosed),
            Self::BookClosed => None,
        }
    }

    /// Whether moving from `self` to `target` is a legal single step.
    pub fn can_advance_to(self, target: Self) -> bool {
        self.next() == Some(target)
    }

    /// Whether the new stream is authoritative in this phase.
    pub const fn new_stream_is_primary(self) -> bool {
        matches!(self, Self::DualRead | Self::Cutover | Self::BookClosed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::DualWrite => "DualWrite",
            Self::DualRead => "DualRead",
            Self::Cutover => "Cutover",
            Self::BookClosed => "BookClosed",
        };
        f.write_str(name)
    }
}

/// Read and write targets for one phase.
///
/// Instances are only built by [`route_for`]: the secondary write target is
/// present iff the phase is `DualWrite` or `DualRead`, the secondary read
/// target iff the phase is `DualRead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRouting {
    phase: MigrationPhase,
    primary_read: StreamId,
    primary_write: StreamId,
    secondary_read: Option<StreamId>,
    secondary_write: Option<StreamId>,
}

impl StreamRouting {
    /// Phase this routing was built for.
    pub const fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Stream reads target first.
    pub const fn primary_read(&self) -> &StreamId {
        &self.primary_read
    }

    /// Stream writes target first and await.
    pub const fn primary_write(&self) -> &StreamId {
        &self.primary_write
    }

    /// Fallback read target, `DualRead` only.
    pub const fn secondary_read(&self) -> Option<&StreamId> {
        self.secondary_read.as_ref()
    }

    /// Mirror write target.
    pub const fn secondary_write(&self) -> Option<&StreamId> {
        self.secondary_write.as_ref()
    }

    /// Streams a write touches, primary first.
    pub fn write_targets(&self) -> Vec<&StreamId> {
        std::iter::once(&self.primary_write)
            .chain(self.secondary_write.as_ref())
            .collect()
    }

    /// Streams a read consults, in order.
    pub fn read_order(&self) -> Vec<&StreamId> {
        std::iter::once(&self.primary_read)
            .chain(self.secondary_read.as_ref())
            .collect()
    }
}

/// Decides where reads and writes go for a phase.
///
/// In `Normal` the `new` stream is ignored.
pub fn route_for(phase: MigrationPhase, old: &StreamId, new: &StreamId) -> StreamRouting {
    match phase {
        MigrationPhase::Normal => StreamRouting {
            phase,
            primary_read: old.clone(),
            primary_write: old.clone(),
            secondary_read: None,
            secondary_write: None,
        },
        MigrationPhase::DualWrite => StreamRouting {
            phase,
            primary_read: old.clone(),
            primary_write: old.clone(),
            secondary_read: None,
            secondary_write: Some(new.clone()),
        },
        MigrationPhase::DualRead => StreamRouting {
            phase,
            primary_read: new.clone(),
            primary_write: new.clone(),
            secondary_read: Some(old.clone()),
            // Mirror target for writers still acting on a DualWrite view.
            secondary_write: Some(old.clone()),
        },
        MigrationPhase::Cutover | MigrationPhase::BookClosed => StreamRouting {
            phase,
            primary_read: new.clone(),
            primary_write: new.clone(),
            secondary_read: None,
            secondary_write: None,
        },
    }
}
