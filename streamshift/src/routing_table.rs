//! Persisted record of the current migration phase per object.
//!
//! The routing table is the one piece of state many instances read and write
//! concurrently. Reads are cheap and lock-free; writes happen only from the
//! orchestrator while it holds the object's migration lock, and every write is
//! a compare-and-set on the previously persisted phase.

use crate::errors::{RoutingError, RoutingResult};
use crate::routing::{route_for, MigrationPhase, StreamRouting};
use crate::types::{MigrationId, ObjectId, StreamId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One object's migration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRoutingEntry {
    /// The object being migrated
    pub object_id: ObjectId,
    /// Current phase
    pub phase: MigrationPhase,
    /// Stream the object is migrating away from
    pub old_stream: StreamId,
    /// Stream the object is migrating to
    pub new_stream: StreamId,
    /// When the migration was first recorded
    pub created_at: Timestamp,
    /// When the phase last changed
    pub updated_at: Timestamp,
    /// Identifies the migration attempt
    pub migration_id: MigrationId,
}

impl MigrationRoutingEntry {
    /// Creates a `Normal` entry for a new migration.
    pub fn new(object_id: ObjectId, old_stream: StreamId, new_stream: StreamId) -> Self {
        let now = Timestamp::now();
        Self {
            object_id,
            phase: MigrationPhase::Normal,
            old_stream,
            new_stream,
            created_at: now,
            updated_at: now,
            migration_id: MigrationId::new(),
        }
    }

    /// Returns a copy moved one phase forward.
    pub fn advance(&self, next: MigrationPhase) -> RoutingResult<Self> {
        if !self.phase.can_advance_to(next) {
            return Err(RoutingError::InvalidTransition {
                object_id: self.object_id.clone(),
                from: self.phase,
                to: next,
            });
        }
        Ok(Self {
            phase: next,
            updated_at: Timestamp::now(),
            ..self.clone()
        })
    }

    /// Routing for this entry's phase.
    pub fn routing(&self) -> StreamRouting {
        route_for(self.phase, &self.old_stream, &self.new_stream)
    }
}

/// Storage for migration routing entries.
#[async_trait]
pub trait RoutingTable: Send + Sync {
    /// Loads the entry for an object.
    async fn get(&self, object_id: &ObjectId) -> RoutingResult<Option<MigrationRoutingEntry>>;

    /// Stores an entry if the persisted phase still equals `expected_phase`.
    ///
    /// `None` means no entry may exist yet. Implementations must also refuse
    /// any write whose phase is not the persisted phase or its successor.
    async fn put(
        &self,
        entry: MigrationRoutingEntry,
        expected_phase: Option<MigrationPhase>,
    ) -> RoutingResult<()>;

    /// Removes an object's entry. Removing a missing entry is a no-op.
    async fn remove(&self, object_id: &ObjectId) -> RoutingResult<()>;

    /// All entries, in no particular order.
    async fn list(&self) -> RoutingResult<Vec<MigrationRoutingEntry>>;
}

/// Checks a compare-and-set write against the currently stored entry.
///
/// Shared by table implementations so they enforce identical rules.
pub fn check_put(
    current: Option<&MigrationRoutingEntry>,
    entry: &MigrationRoutingEntry,
    expected_phase: Option<MigrationPhase>,
) -> RoutingResult<()> {
    let actual = current.map(|existing| existing.phase);
    if actual != expected_phase {
        return Err(RoutingError::Conflict {
            object_id: entry.object_id.clone(),
            expected: expected_phase,
            actual,
        });
    }
    if let Some(existing) = current {
        if existing.migration_id != entry.migration_id {
            return Err(RoutingError::Conflict {
                object_id: entry.object_id.clone(),
                expected: expected_phase,
                actual,
            });
        }
        if existing.phase != entry.phase && !existing.phase.can_advance_to(entry.phase) {
            return Err(RoutingError::InvalidTransition {
                object_id: entry.object_id.clone(),
                from: existing.phase,
                to: entry.phase,
            });
        }
    }
    Ok(())
}

/// Resolves the routing an application call should use.
///
/// Objects without an entry route everything to `default_stream`.
pub async fn routing_for<T>(
    table: &T,
    object_id: &ObjectId,
    default_stream: &StreamId,
) -> RoutingResult<StreamRouting>
where
    T: RoutingTable + ?Sized,
{
    Ok(match table.get(object_id).await? {
        Some(entry) => entry.routing(),
        None => route_for(MigrationPhase::Normal, default_stream, default_stream),
    })
}

/// In-memory routing table for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRoutingTable {
    entries: Arc<RwLock<HashMap<ObjectId, MigrationRoutingEntry>>>,
}

impl InMemoryRoutingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoutingTable for InMemoryRoutingTable {
    async fn get(&self, object_id: &ObjectId) -> RoutingResult<Option<MigrationRoutingEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|e| RoutingError::Backend(format!("Lock poisoned: {e}")))?
            .get(object_id)
            .cloned())
    }

    async fn put(
        &self,
        entry: MigrationRoutingEntry,
        expected_phase: Option<MigrationPhase>,
    ) -> RoutingResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| RoutingError::Backend(format!("Lock poisoned: {e}")))?;
        check_put(entries.get(&entry.object_id), &entry, expected_phase)?;
        let _ = entries.insert(entry.object_id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, object_id: &ObjectId) -> RoutingResult<()> {
        let _ = self
            .entries
            .write()
            .map_err(|e| RoutingError::Backend(format!("Lock poisoned: {e}")))?
            .remove(object_id);
        Ok(())
    }

    async fn list(&self) -> RoutingResult<Vec<MigrationRoutingEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|e| RoutingError::Backend(format!("Lock poisoned: {e}")))?
            .values()
            .cloned()
            .collect())
    }
}
