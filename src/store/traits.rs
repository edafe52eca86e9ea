//! Store contracts shared by the router, the registry, and the modules.
//!
//! Every store serializes conflicting writes per author: `append`, `get` and
//! `step_toward` for the same author are linearizable, while different authors
//! proceed independently.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::emotion::{EmotionState, EmotionTargets};
use crate::error::DatabaseError;
use crate::registry::ModuleDescriptor;
use crate::scheduler::ScheduledTask;

/// One stored interaction. `recorded_at` is the UTC-normalized instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: i64,
    pub author_id: String,
    pub body: String,
    pub recorded_at: NaiveDateTime,
}

/// Append-only log of interactions.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one record. Returns the new record id.
    async fn append(
        &self,
        author_id: &str,
        body: &str,
        recorded_at: NaiveDateTime,
    ) -> Result<i64, DatabaseError>;

    /// All records of `author_id` with `recorded_at >= since`, in insertion order.
    async fn query_since(
        &self,
        author_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<HistoryRecord>, DatabaseError>;
}

/// Per-user mood storage.
#[async_trait]
pub trait EmotionStore: Send + Sync {
    /// Current state for the user behind `author_id`, initialized to the default
    /// (and persisted) on first access.
    async fn get(&self, author_id: &str) -> Result<EmotionState, DatabaseError>;

    /// Move the targeted axes toward their targets by at most `delta`, persist, and
    /// return the new state.
    async fn step_toward(
        &self,
        author_id: &str,
        targets: &EmotionTargets,
        delta: u8,
    ) -> Result<EmotionState, DatabaseError>;
}

/// Persistent module table backing the registry.
#[async_trait]
pub trait ModuleCatalog: Send + Sync {
    /// All rows ordered by priority, then registration (row id).
    async fn list_modules(&self) -> Result<Vec<ModuleDescriptor>, DatabaseError>;

    /// Insert or update by unique name. An update keeps the original registration slot.
    async fn upsert_module(&self, descriptor: &ModuleDescriptor) -> Result<(), DatabaseError>;

    /// Returns false when no module has that name.
    async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<bool, DatabaseError>;

    /// Returns false when no module has that name.
    async fn remove_module(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Payload kinds accepted: the core kinds first, then each distinct module type.
    async fn module_content_types(&self) -> Result<Vec<String>, DatabaseError>;
}

/// Device to user mapping.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Attach a device (author id) to a username, replacing any previous link.
    async fn link_device(&self, author_id: &str, username: &str) -> Result<(), DatabaseError>;

    /// Username linked to the device, if any.
    async fn resolve_username(&self, author_id: &str) -> Result<Option<String>, DatabaseError>;
}

/// Persistent scheduled tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks, by id.
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError>;

    /// Insert a task, ignoring its `id`. Returns the new id.
    async fn add_task(&self, task: &ScheduledTask) -> Result<i64, DatabaseError>;

    /// Overwrite the task with the same id. Returns false when there is none.
    async fn update_task(&self, task: &ScheduledTask) -> Result<bool, DatabaseError>;

    /// Returns false when there is no task with that id.
    async fn remove_task(&self, id: i64) -> Result<bool, DatabaseError>;

    /// First task of `module` whose parameter contains every entry of `subset`.
    async fn search_task(
        &self,
        module: &str,
        subset: &HashMap<String, String>,
    ) -> Result<Option<ScheduledTask>, DatabaseError>;
}
