//! Core types for the `streamshift` migration engine.
//!
//! This module defines the identifiers and value types used throughout the
//! library. All types use smart constructors to ensure validity at construction
//! time, following the "parse, don't validate" principle.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stream identifier that uniquely identifies an event stream.
///
/// `StreamId` values are guaranteed to be non-empty and at most 255 characters.
/// Once constructed, a `StreamId` is always valid - no further validation needed.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamId(String);

/// Identifies the logical object (aggregate, document) whose stream is migrated.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ObjectId(String);

/// Opaque key scoping a distributed lock.
///
/// Providers never interpret the key; the `migration:{objectId}` convention is
/// only a helper for callers.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LockKey(String);

impl LockKey {
    /// Builds the conventional `migration:{objectId}` lock key.
    pub fn for_migration(object_id: &ObjectId) -> Self {
        // ObjectId is non-empty and at most 255 chars, so the key always fits.
        Self::try_new(format!("migration:{object_id}"))
            .expect("migration lock key derived from a valid ObjectId is always valid")
    }
}

/// The type name of a recorded event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventTypeName(String);

/// A globally unique event identifier using UUIDv7 format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn new() -> Self {
        // This will always succeed as Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one migration attempt of one object.
///
/// A resumed migration keeps the identifier persisted in its routing entry.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct MigrationId(Uuid);

impl MigrationId {
    /// Creates a new time-ordered migration identifier.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one grant of a distributed lock (fencing token).
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LockId(Uuid);

impl LockId {
    /// Creates a new lock grant identifier.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies a dry-run migration plan.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PlanId(Uuid);

impl PlanId {
    /// Creates a new plan identifier.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

/// The version of a stream, or of one event within a stream.
///
/// An empty stream is at version 0; the first event written gets version 1.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventVersion(u64);

impl EventVersion {
    /// The version of a stream with no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the next version after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Returns the version `count` events after this one.
    #[must_use]
    pub fn advance_by(self, count: u64) -> Self {
        Self::new(self.into_inner() + count)
    }

    /// Number of versions `self` trails `other` by; zero when `self` is level or ahead.
    pub fn lag_behind(self, other: Self) -> u64 {
        other.into_inner().saturating_sub(self.into_inner())
    }
}

/// A timestamp for when something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
