//! `TaskStore` trait: async persistence of committed task documents.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::task::Task;

/// Last-committed task per `instanceId` plus the set of active instances.
///
/// Implementations store the storage form of a task (no hop metadata, no
/// pending command); see [`crate::sync::merge::prepare_for_storage`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Load the committed task for an instance.
    async fn get(&self, instance_id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Persist the committed task for an instance.
    async fn set(&self, instance_id: &str, task: &Task) -> Result<(), DatabaseError>;

    /// Whether a committed task exists.
    async fn has(&self, instance_id: &str) -> Result<bool, DatabaseError>;

    /// Remove a committed task.
    async fn delete(&self, instance_id: &str) -> Result<(), DatabaseError>;

    // ── Active set ──────────────────────────────────────────────────

    /// Mark an instance active or inactive.
    async fn set_active(&self, instance_id: &str, active: bool) -> Result<(), DatabaseError>;

    async fn is_active(&self, instance_id: &str) -> Result<bool, DatabaseError>;

    /// All active instance ids, sorted.
    async fn active_ids(&self) -> Result<Vec<String>, DatabaseError>;
}
