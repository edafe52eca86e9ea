//! libSQL backend: async implementation of every store trait.
//!
//! A single connection is reused for all operations. All statements are
//! parameterized. Read-modify-write sequences on emotions hold a per-user lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::emotion::{AXIS_DEFAULT, EmotionState, EmotionTargets};
use crate::error::DatabaseError;
use crate::interaction::CORE_DATATYPES;
use crate::registry::ModuleDescriptor;
use crate::scheduler::{DaySpec, ScheduledTask, parse_time_of_day};
use crate::store::author_locks::AuthorLocks;
use crate::store::migrations;
use crate::store::traits::{
    EmotionStore, HistoryRecord, HistoryStore, IdentityStore, ModuleCatalog, TaskStore,
};

/// Fixed-width storage format for `History.tm`, so text comparison is chronological.
const HISTORY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const MODULE_COLUMNS: &str = "name, priority, enabled, type, condition, path, metadata";

const TASK_COLUMNS: &str = "id, module, parameter, at, seconds, minutes, hours, days, repeat";

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    author_locks: AuthorLocks,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            author_locks: AuthorLocks::new(),
        })
    }

    /// Run pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Row key for the user behind a device: the linked username, else the device id.
    async fn emotion_key(&self, author_id: &str) -> Result<String, DatabaseError> {
        Ok(self
            .resolve_username(author_id)
            .await?
            .unwrap_or_else(|| author_id.to_string()))
    }

    /// Read the emotions row for `key`, inserting the default first if absent.
    async fn load_or_init(&self, key: &str) -> Result<EmotionState, DatabaseError> {
        let d = AXIS_DEFAULT as i64;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO emotions (username, love, joy, surprise, anger, sadness, fear)
                 VALUES (?1, ?2, ?2, ?2, ?2, ?2, ?2)",
                params![key, d],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("init emotions: {e}")))?;
        if inserted > 0 {
            debug!(user = key, "Initialized emotions");
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT love, joy, surprise, anger, sadness, fear FROM emotions WHERE username = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get emotions: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_emotions(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "emotions".to_string(),
                id: key.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get emotions: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn format_recorded_at(t: NaiveDateTime) -> String {
    t.format(HISTORY_TIME_FORMAT).to_string()
}

/// Parse a stored `tm` value. Accepts our format, bare seconds, and RFC 3339.
fn parse_recorded_at(s: &str) -> Option<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t);
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc())
}

const EMOTION_AXES: [&str; 6] = ["love", "joy", "surprise", "anger", "sadness", "fear"];

fn row_to_emotions(row: &libsql::Row) -> Result<EmotionState, DatabaseError> {
    let mut axes = [0i64; 6];
    for (idx, (value, name)) in axes.iter_mut().zip(EMOTION_AXES).enumerate() {
        *value = row
            .get::<i64>(idx as i32)
            .map_err(|e| DatabaseError::Serialization(format!("emotions {name}: {e}")))?;
    }
    let [love, joy, surprise, anger, sadness, fear] = axes;
    Ok(EmotionState::new(love, joy, surprise, anger, sadness, fear))
}

fn row_to_history(row: &libsql::Row) -> Result<HistoryRecord, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("history id: {e}")))?;
    let author_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("history author: {e}")))?;
    let body: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(format!("history body: {e}")))?;
    let tm: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(format!("history tm: {e}")))?;
    let recorded_at = parse_recorded_at(&tm)
        .ok_or_else(|| DatabaseError::Serialization(format!("history tm '{tm}' is not a datetime")))?;
    Ok(HistoryRecord {
        id,
        author_id,
        body,
        recorded_at,
    })
}

/// Map a row selected with MODULE_COLUMNS to a descriptor.
fn row_to_descriptor(row: &libsql::Row) -> Result<ModuleDescriptor, libsql::Error> {
    let name: String = row.get(0)?;
    let priority: i64 = row.get(1)?;
    let enabled: i64 = row.get::<i64>(2).unwrap_or(0);
    let content_type: String = row.get(3)?;
    let condition: String = row.get(4)?;
    let location: String = row.get(5)?;
    let metadata_str: String = row.get::<String>(6).unwrap_or_else(|_| "{}".into());

    let metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
        tracing::warn!(module = %name, "Ignoring unparseable module metadata: {e}");
        serde_json::json!({})
    });

    Ok(ModuleDescriptor {
        name,
        priority,
        enabled: enabled != 0,
        content_type,
        condition,
        location,
        metadata,
    })
}

/// Map a row selected with TASK_COLUMNS to a task.
fn row_to_task(row: &libsql::Row) -> Result<ScheduledTask, DatabaseError> {
    let field = |name: &str, e: libsql::Error| DatabaseError::Serialization(format!("task {name}: {e}"));
    let count = |name: &str, value: i64| {
        u32::try_from(value)
            .map_err(|_| DatabaseError::Serialization(format!("task {name}: {value} out of range")))
    };

    let id: i64 = row.get(0).map_err(|e| field("id", e))?;
    let module: String = row.get(1).map_err(|e| field("module", e))?;
    let parameter: String = row.get(2).map_err(|e| field("parameter", e))?;
    let parameter: HashMap<String, String> = serde_json::from_str(&parameter)
        .map_err(|e| DatabaseError::Serialization(format!("task {id} parameter: {e}")))?;
    let at: String = row.get(3).map_err(|e| field("at", e))?;
    let at = parse_time_of_day(&at).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let seconds = count("seconds", row.get(4).map_err(|e| field("seconds", e))?)?;
    let minutes = count("minutes", row.get(5).map_err(|e| field("minutes", e))?)?;
    let hours = count("hours", row.get(6).map_err(|e| field("hours", e))?)?;
    let days: String = row.get(7).map_err(|e| field("days", e))?;
    let days = DaySpec::parse(&days).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let repeat: i64 = row.get(8).map_err(|e| field("repeat", e))?;

    Ok(ScheduledTask {
        id,
        module,
        parameter,
        at,
        hours,
        minutes,
        seconds,
        days,
        repeat: repeat != 0,
    })
}

fn format_time_of_day(task: &ScheduledTask) -> String {
    task.at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl HistoryStore for LibSqlBackend {
    async fn append(
        &self,
        author_id: &str,
        body: &str,
        recorded_at: NaiveDateTime,
    ) -> Result<i64, DatabaseError> {
        // The id comes back with the insert; the connection is shared across cycles.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO History (author_ring_id, body, tm) VALUES (?1, ?2, ?3) RETURNING id",
                params![author_id, body, format_recorded_at(recorded_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append history: {e}")))?;

        let id: i64 = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("append history: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(format!("history id: {e}")))?,
            None => {
                return Err(DatabaseError::Query(
                    "append history: insert returned no id".to_string(),
                ));
            }
        };
        debug!(id, author = author_id, "History record appended");
        Ok(id)
    }

    async fn query_since(
        &self,
        author_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<HistoryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, author_ring_id, body, tm FROM History
                 WHERE author_ring_id = ?1 AND tm >= ?2 ORDER BY id ASC",
                params![author_id, format_recorded_at(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query history: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query history: {e}")))?
        {
            records.push(row_to_history(&row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl EmotionStore for LibSqlBackend {
    async fn get(&self, author_id: &str) -> Result<EmotionState, DatabaseError> {
        let key = self.emotion_key(author_id).await?;
        self.load_or_init(&key).await
    }

    async fn step_toward(
        &self,
        author_id: &str,
        targets: &EmotionTargets,
        delta: u8,
    ) -> Result<EmotionState, DatabaseError> {
        let key = self.emotion_key(author_id).await?;
        let _guard = self.author_locks.lock(&key).await;

        let current = self.load_or_init(&key).await?;
        let next = current.stepped_toward(targets, delta);
        if next == current {
            return Ok(current);
        }

        self.conn()
            .execute(
                "UPDATE emotions SET love = ?1, joy = ?2, surprise = ?3, anger = ?4,
                    sadness = ?5, fear = ?6
                 WHERE username = ?7",
                params![
                    next.love as i64,
                    next.joy as i64,
                    next.surprise as i64,
                    next.anger as i64,
                    next.sadness as i64,
                    next.fear as i64,
                    key.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update emotions: {e}")))?;

        debug!(user = %key, delta, "Emotions stepped");
        Ok(next)
    }
}

#[async_trait]
impl ModuleCatalog for LibSqlBackend {
    async fn list_modules(&self) -> Result<Vec<ModuleDescriptor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MODULE_COLUMNS} FROM modules ORDER BY priority ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_modules: {e}")))?;

        let mut modules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_modules: {e}")))?
        {
            match row_to_descriptor(&row) {
                Ok(descriptor) => modules.push(descriptor),
                Err(e) => {
                    tracing::warn!("Skipping module row: {e}");
                }
            }
        }
        Ok(modules)
    }

    async fn upsert_module(&self, descriptor: &ModuleDescriptor) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&descriptor.metadata)
            .map_err(|e| DatabaseError::Serialization(format!("module metadata: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO modules (name, priority, enabled, type, condition, path, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    priority = excluded.priority,
                    enabled = excluded.enabled,
                    type = excluded.type,
                    condition = excluded.condition,
                    path = excluded.path,
                    metadata = excluded.metadata",
                params![
                    descriptor.name.as_str(),
                    descriptor.priority,
                    descriptor.enabled as i64,
                    descriptor.content_type.as_str(),
                    descriptor.condition.as_str(),
                    descriptor.location.as_str(),
                    metadata
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_module: {e}")))?;

        debug!(module = %descriptor.name, "Module row upserted");
        Ok(())
    }

    async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE modules SET enabled = ?1 WHERE name = ?2",
                params![enabled as i64, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_module_enabled: {e}")))?;
        Ok(count > 0)
    }

    async fn remove_module(&self, name: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM modules WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_module: {e}")))?;
        Ok(count > 0)
    }

    async fn module_content_types(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT DISTINCT type FROM modules ORDER BY type ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("module_content_types: {e}")))?;

        let mut types: Vec<String> = CORE_DATATYPES.iter().map(|t| t.to_string()).collect();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("module_content_types: {e}")))?
        {
            let kind: String = row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(format!("module type: {e}")))?;
            if !types.contains(&kind) {
                types.push(kind);
            }
        }
        Ok(types)
    }
}

#[async_trait]
impl IdentityStore for LibSqlBackend {
    async fn link_device(&self, author_id: &str, username: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO devices (hash, username) VALUES (?1, ?2)
                 ON CONFLICT(hash) DO UPDATE SET username = excluded.username",
                params![author_id, username],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_device: {e}")))?;
        info!(device = author_id, user = username, "Device linked");
        Ok(())
    }

    async fn resolve_username(&self, author_id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT username FROM devices WHERE hash = ?1 LIMIT 1",
                params![author_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_username: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<String>(0)
                .ok()
                .filter(|username| !username.is_empty())),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("resolve_username: {e}"))),
        }
    }
}

impl LibSqlBackend {
    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("query tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query tasks: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduler ORDER BY id ASC"),
            (),
        )
        .await
    }

    async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM scheduler WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
        {
            Some(row) => row_to_task(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn add_task(&self, task: &ScheduledTask) -> Result<i64, DatabaseError> {
        let parameter = serde_json::to_string(&task.parameter)
            .map_err(|e| DatabaseError::Serialization(format!("task parameter: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO scheduler (module, parameter, at, seconds, minutes, hours, days, repeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING id",
                params![
                    task.module.as_str(),
                    parameter,
                    format_time_of_day(task),
                    task.seconds as i64,
                    task.minutes as i64,
                    task.hours as i64,
                    task.days.to_string(),
                    task.repeat as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_task: {e}")))?;

        let id: i64 = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("add_task: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?,
            None => return Err(DatabaseError::Query("add_task: insert returned no id".to_string())),
        };
        info!(task = id, module = %task.module, "Scheduled task added");
        Ok(id)
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<bool, DatabaseError> {
        let parameter = serde_json::to_string(&task.parameter)
            .map_err(|e| DatabaseError::Serialization(format!("task parameter: {e}")))?;

        let count = self
            .conn()
            .execute(
                "UPDATE scheduler SET module = ?1, parameter = ?2, at = ?3, seconds = ?4,
                    minutes = ?5, hours = ?6, days = ?7, repeat = ?8
                 WHERE id = ?9",
                params![
                    task.module.as_str(),
                    parameter,
                    format_time_of_day(task),
                    task.seconds as i64,
                    task.minutes as i64,
                    task.hours as i64,
                    task.days.to_string(),
                    task.repeat as i64,
                    task.id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;
        Ok(count > 0)
    }

    async fn remove_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM scheduler WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_task: {e}")))?;
        Ok(count > 0)
    }

    async fn search_task(
        &self,
        module: &str,
        subset: &HashMap<String, String>,
    ) -> Result<Option<ScheduledTask>, DatabaseError> {
        let tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM scheduler WHERE module = ?1 ORDER BY id ASC"),
                params![module],
            )
            .await?;
        Ok(tasks.into_iter().find(|task| {
            subset
                .iter()
                .all(|(key, value)| task.parameter.get(key) == Some(value))
        }))
    }
}
