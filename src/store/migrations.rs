//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! A database created by the older `user_version`-based schema (a `modules`
//! table but no `_migrations` table) is upgraded in place: missing columns,
//! tables and unique indexes are added, then V1 is seeded without re-running DDL.
//! A legacy `scheduler` table, which referenced modules by row id, is rebuilt
//! with module names.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const SCHEDULER_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS scheduler (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        module TEXT NOT NULL,
        parameter TEXT NOT NULL DEFAULT '{}',
        at TEXT NOT NULL DEFAULT '',
        seconds INTEGER NOT NULL DEFAULT 0 CHECK (seconds >= 0),
        minutes INTEGER NOT NULL DEFAULT 0 CHECK (minutes >= 0),
        hours INTEGER NOT NULL DEFAULT 0 CHECK (hours >= 0),
        days TEXT NOT NULL DEFAULT '',
        repeat INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_scheduler_module ON scheduler(module);
"#;

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS modules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                type TEXT NOT NULL DEFAULT '*',
                condition TEXT NOT NULL,
                path TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_modules_name ON modules(name);
            CREATE INDEX IF NOT EXISTS idx_modules_priority ON modules(priority);

            CREATE TABLE IF NOT EXISTS History (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                author_ring_id TEXT NOT NULL,
                body TEXT NOT NULL,
                tm TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_author_tm ON History(author_ring_id, tm);

            CREATE TABLE IF NOT EXISTS emotions (
                username TEXT PRIMARY KEY,
                love INTEGER NOT NULL DEFAULT 50 CHECK (love BETWEEN 0 AND 100),
                joy INTEGER NOT NULL DEFAULT 50 CHECK (joy BETWEEN 0 AND 100),
                surprise INTEGER NOT NULL DEFAULT 50 CHECK (surprise BETWEEN 0 AND 100),
                anger INTEGER NOT NULL DEFAULT 50 CHECK (anger BETWEEN 0 AND 100),
                sadness INTEGER NOT NULL DEFAULT 50 CHECK (sadness BETWEEN 0 AND 100),
                fear INTEGER NOT NULL DEFAULT 50 CHECK (fear BETWEEN 0 AND 100)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "device_identity",
        sql: r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                username TEXT NOT NULL,
                devicename TEXT NOT NULL DEFAULT ''
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_hash ON devices(hash);
            CREATE INDEX IF NOT EXISTS idx_devices_username ON devices(username);
        "#,
    },
    Migration {
        version: 3,
        name: "scheduled_tasks",
        sql: SCHEDULER_SCHEMA,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    if current_version == 0 && table_exists(conn, "modules").await? {
        // Older schema: modules had no metadata column and no unique name,
        // History was created lazily by the logging module.
        let _ = conn
            .execute(
                "ALTER TABLE modules ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}'",
                (),
            )
            .await;

        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_modules_name ON modules(name);
            CREATE INDEX IF NOT EXISTS idx_modules_priority ON modules(priority);

            CREATE TABLE IF NOT EXISTS History (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                author_ring_id TEXT NOT NULL,
                body TEXT NOT NULL,
                tm TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_author_tm ON History(author_ring_id, tm);

            CREATE TABLE IF NOT EXISTS emotions (
                username TEXT PRIMARY KEY,
                love INTEGER NOT NULL DEFAULT 50,
                joy INTEGER NOT NULL DEFAULT 50,
                surprise INTEGER NOT NULL DEFAULT 50,
                anger INTEGER NOT NULL DEFAULT 50,
                sadness INTEGER NOT NULL DEFAULT 50,
                fear INTEGER NOT NULL DEFAULT 50
            );",
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to upgrade legacy schema: {e}")))?;

        if table_exists(conn, "scheduler").await? {
            upgrade_legacy_scheduler(conn).await?;
        }

        seed_version(conn, 1, "initial_schema").await?;
        tracing::info!("Legacy database detected, seeded migration V1");
    }

    let current_version = get_current_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Rebuild the older `scheduler` table, whose `module` column held a module row
/// id, with module names. Tasks pointing at missing modules are dropped.
async fn upgrade_legacy_scheduler(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("ALTER TABLE scheduler RENAME TO scheduler_legacy;")
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to set aside legacy scheduler: {e}")))?;
    conn.execute_batch(SCHEDULER_SCHEMA)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to create scheduler table: {e}")))?;

    let copied = conn
        .execute(
            "INSERT INTO scheduler (id, module, parameter, at, seconds, minutes, hours, days, repeat)
             SELECT s.id, m.name, COALESCE(s.parameter, '{}'), COALESCE(s.at, ''),
                    COALESCE(s.seconds, 0), COALESCE(s.minutes, 0), COALESCE(s.hours, 0),
                    COALESCE(s.days, ''), COALESCE(s.repeat, 0)
             FROM scheduler_legacy s JOIN modules m ON m.id = s.module",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to copy legacy tasks: {e}")))?;

    conn.execute_batch("DROP TABLE scheduler_legacy;")
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to drop legacy scheduler: {e}")))?;
    tracing::info!(tasks = copied, "Legacy scheduled tasks converted");
    Ok(())
}

/// Check if a table already exists.
async fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            libsql::params![table],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check table {table}: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check table {table}: {e}")))?;

    match row {
        Some(row) => {
            let count: i64 = row.get(0).unwrap_or(0);
            Ok(count > 0)
        }
        None => Ok(false),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["modules", "History", "emotions", "devices", "scheduler", "_migrations"] {
            assert!(table_exists(&conn, table).await.unwrap(), "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn legacy_db_is_upgraded() {
        let conn = test_conn().await;

        conn.execute_batch(
            "CREATE TABLE modules (
                id          INTEGER PRIMARY KEY,
                name        TEXT,
                priority    INTEGER,
                enabled     BOOLEAN,
                type        TEXT,
                condition   TEXT,
                path        TEXT
            );
            CREATE TABLE emotions (
                username    TEXT PRIMARY KEY,
                love        INTEGER,
                joy         INTEGER,
                surprise    INTEGER,
                anger       INTEGER,
                sadness     INTEGER,
                fear        INTEGER
            );
            CREATE TABLE devices (
                id               INTEGER PRIMARY KEY,
                hash             TEXT,
                username         TEXT,
                sub_author       TEXT,
                devicename       TEXT,
                additional_types TEXT,
                is_bridge        INTEGER
            );
            CREATE TABLE scheduler (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                module      INTEGER,
                parameter   TEXT,
                at          TEXT,
                seconds     INTEGER,
                minutes     INTEGER,
                hours       INTEGER,
                days        STRING,
                repeat      INTEGER
            );
            INSERT INTO modules (name, priority, enabled, type, condition, path)
                VALUES ('history', 0, 1, 'text/plain', '.*', 'history');
            INSERT INTO scheduler (module, parameter, at, seconds, minutes, hours, days, repeat)
                VALUES (1, '{\"ring_id\":\"dev\",\"username\":\"alice\"}', '', 0, 5, 0, '', 1);
            INSERT INTO scheduler (module, parameter, at, seconds, minutes, hours, days, repeat)
                VALUES (42, '{}', '', 0, 5, 0, '', 1);",
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
        assert!(table_exists(&conn, "History").await.unwrap());

        let mut rows = conn
            .query("SELECT metadata FROM modules WHERE name = 'history'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let metadata: String = row.get(0).unwrap();
        assert_eq!(metadata, "{}");

        let dup = conn
            .execute(
                "INSERT INTO modules (name, priority, enabled, type, condition, path)
                 VALUES ('history', 1, 1, 'text', '.*', 'history')",
                (),
            )
            .await;
        assert!(dup.is_err(), "module names must be unique after upgrade");

        let mut rows = conn
            .query("SELECT module, minutes, repeat FROM scheduler", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "history");
        assert_eq!(row.get::<i64>(1).unwrap(), 5);
        assert_eq!(row.get::<i64>(2).unwrap(), 1);
        assert!(rows.next().await.unwrap().is_none(), "orphaned task should be dropped");
        assert!(!table_exists(&conn, "scheduler_legacy").await.unwrap());
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "device_identity");

        let row3 = rows.next().await.unwrap().unwrap();
        assert_eq!(row3.get::<i64>(0).unwrap(), 3);
        assert_eq!(row3.get::<String>(1).unwrap(), "scheduled_tasks");
    }
}
