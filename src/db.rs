//! Local SQLite layer for the Brightcart engine.
//!
//! One database file per store workspace, holding the offline request queue,
//! the cached product/customer lists, and a small meta table (sale-number
//! counter and similar). Uses rusqlite with WAL mode. When the file cannot
//! be opened the engine degrades to an in-memory database: everything keeps
//! working for the session, the queue just will not survive a restart.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};

/// Database file name inside the per-workspace directory.
const DB_FILE: &str = "brightcart.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Shared handle to the per-workspace database.
pub struct LocalDb {
    pub conn: Mutex<Connection>,
    pub path: PathBuf,
    /// False when the on-disk database could not be opened and we fell back
    /// to an in-memory connection.
    pub durable: bool,
}

/// Open (or create) the workspace database at `{workspace_dir}/brightcart.db`.
pub fn open(workspace_dir: &Path) -> CoreResult<LocalDb> {
    fs::create_dir_all(workspace_dir)
        .map_err(|e| CoreError::Storage(format!("create workspace dir: {e}")))?;

    let path = workspace_dir.join(DB_FILE);
    info!("Opening workspace database at {}", path.display());

    let conn = open_and_configure(&path)?;
    run_migrations(&conn)?;

    Ok(LocalDb {
        conn: Mutex::new(conn),
        path,
        durable: true,
    })
}

/// Open the workspace database, degrading to an in-memory connection when
/// the file cannot be opened. The degraded queue is lost on restart, which
/// is the accepted trade — the register must keep selling.
pub fn open_or_memory(workspace_dir: &Path) -> CoreResult<LocalDb> {
    match open(workspace_dir) {
        Ok(db) => Ok(db),
        Err(e) => {
            warn!(
                dir = %workspace_dir.display(),
                error = %e,
                "Workspace database unavailable, degrading to in-memory queue"
            );
            let conn = Connection::open_in_memory()
                .map_err(|e| CoreError::Storage(format!("in-memory open: {e}")))?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )
            .map_err(|e| CoreError::Storage(format!("in-memory pragma setup: {e}")))?;
            run_migrations(&conn)?;
            Ok(LocalDb {
                conn: Mutex::new(conn),
                path: PathBuf::from(":memory:"),
                durable: false,
            })
        }
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> CoreResult<Connection> {
    let conn =
        Connection::open(path).map_err(|e| CoreError::Storage(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| CoreError::Storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| CoreError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating workspace database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: request queue, catalog caches, and meta.
fn migrate_v1(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- Offline request queue. `id` is client-generated and doubles as
        -- the idempotency key sent to the backend on replay.
        CREATE TABLE IF NOT EXISTS request_queue (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Last authoritative snapshot of each product/customer, so a
        -- restart while offline still has a catalog to show.
        CREATE TABLE IF NOT EXISTS product_cache (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS customer_cache (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Small category/key/value store (sale-number counter etc.).
        CREATE TABLE IF NOT EXISTS local_meta (
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (category, key)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_request_queue_status
            ON request_queue(status, enqueued_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        CoreError::Storage(format!("migration v1: {e}"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Meta helpers
// ---------------------------------------------------------------------------

/// Get a single meta value.
pub fn get_meta(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM local_meta WHERE category = ?1 AND key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a meta value.
pub fn set_meta(conn: &Connection, category: &str, key: &str, value: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO local_meta (category, key, value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(category, key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| CoreError::Storage(format!("set_meta: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sale numbering
// ---------------------------------------------------------------------------

/// Generate a sequential sale number in format S-DDMMYYYY-NNNNN.
///
/// Uses `local_meta` (category='sales', key='sale_counter') as a persistent
/// per-workspace counter. The date part is the register's local date.
pub fn next_sale_number(conn: &Connection) -> String {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let current: i64 = get_meta(conn, "sales", "sale_counter")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    let next = current + 1;
    if let Err(e) = set_meta(conn, "sales", "sale_counter", &next.to_string()) {
        warn!("sale counter persist failed: {e}");
    }

    format!("S-{}-{:05}", date_display, next)
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migration_v1_creates_tables() {
        let conn = test_conn();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        assert!(
            tables.contains(&"request_queue".to_string()),
            "missing request_queue"
        );
        assert!(
            tables.contains(&"product_cache".to_string()),
            "missing product_cache"
        );
        assert!(
            tables.contains(&"customer_cache".to_string()),
            "missing customer_cache"
        );
        assert!(
            tables.contains(&"local_meta".to_string()),
            "missing local_meta"
        );
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_meta_roundtrip() {
        let conn = test_conn();
        run_migrations(&conn).unwrap();

        assert_eq!(get_meta(&conn, "sales", "sale_counter"), None);
        set_meta(&conn, "sales", "sale_counter", "7").unwrap();
        assert_eq!(
            get_meta(&conn, "sales", "sale_counter").as_deref(),
            Some("7")
        );
        set_meta(&conn, "sales", "sale_counter", "8").unwrap();
        assert_eq!(
            get_meta(&conn, "sales", "sale_counter").as_deref(),
            Some("8")
        );
    }

    #[test]
    fn test_sale_numbers_are_sequential() {
        let conn = test_conn();
        run_migrations(&conn).unwrap();

        let first = next_sale_number(&conn);
        let second = next_sale_number(&conn);

        assert!(first.starts_with("S-"), "unexpected format: {first}");
        assert!(first.ends_with("-00001"), "unexpected format: {first}");
        assert!(second.ends_with("-00002"), "unexpected format: {second}");
    }

    #[test]
    fn test_open_or_memory_degrades_when_dir_is_a_file() {
        let blocker = std::env::temp_dir().join(format!(
            "brightcart-db-degrade-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let db = open_or_memory(&blocker).expect("degraded open should work");
        assert!(!db.durable);
        assert_eq!(db.path, PathBuf::from(":memory:"));

        // The degraded database is fully migrated and usable.
        let conn = db.conn.lock().unwrap();
        assert!(get_meta(&conn, "sales", "sale_counter").is_none());
        drop(conn);

        let _ = std::fs::remove_file(&blocker);
    }

    #[test]
    fn test_open_creates_file_and_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("brightcart-db-open-{}", uuid::Uuid::new_v4()));

        let db = open(&dir).expect("open should succeed");
        assert!(db.durable);
        {
            let conn = db.conn.lock().unwrap();
            set_meta(&conn, "test", "marker", "kept").unwrap();
        }
        drop(db);

        let db = open(&dir).expect("reopen should succeed");
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_meta(&conn, "test", "marker").as_deref(), Some("kept"));
        drop(conn);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
