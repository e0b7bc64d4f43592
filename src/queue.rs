//! Durable offline request queue.
//!
//! Every operation that could not reach the backend is stored here and
//! replayed later by the dispatcher. The row id is the client-generated
//! UUID for the operation and doubles as the idempotency key on replay,
//! so a request that was applied but whose response was lost is safe to
//! send again.
//!
//! Lifecycle: `pending` -> `syncing` -> removed on success, back to
//! `pending` on a retryable failure, or `failed` when the backend
//! rejected the payload and a human has to look at it.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::LocalDb;
use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What kind of operation a queue row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Sale,
    Receipt,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Sale => "sale",
            RequestKind::Receipt => "receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sale" => Some(RequestKind::Sale),
            "receipt" => Some(RequestKind::Receipt),
            _ => None,
        }
    }
}

/// Queue row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Syncing,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Syncing => "syncing",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "syncing" => Some(RequestStatus::Syncing),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

/// One queued operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Client-generated UUID. Sent to the backend as the idempotency key.
    pub id: String,
    pub kind: RequestKind,
    pub payload: serde_json::Value,
    pub status: RequestStatus,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub enqueued_at: String,
    pub updated_at: String,
}

/// Per-status row counts, for the sync status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub syncing: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// Enqueue an operation. Duplicate ids are ignored so a double submit of
/// the same client id cannot create two rows.
pub fn enqueue(
    db: &LocalDb,
    id: &str,
    kind: RequestKind,
    payload: &serde_json::Value,
) -> CoreResult<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let payload_text = serde_json::to_string(payload)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO request_queue (id, kind, payload, status)
         VALUES (?1, ?2, ?3, 'pending')",
        params![id, kind.as_str(), payload_text],
    )?;

    if inserted == 0 {
        debug!(request_id = %id, "Request already queued, ignoring duplicate enqueue");
    } else {
        info!(request_id = %id, kind = kind.as_str(), "Request queued for sync");
    }
    Ok(())
}

/// Rows still waiting to sync, in enqueue order.
pub fn list_pending(db: &LocalDb) -> CoreResult<Vec<QueuedRequest>> {
    Ok(list_all(db)?
        .into_iter()
        .filter(|r| r.status == RequestStatus::Pending)
        .collect())
}

/// All queue rows in enqueue order, for the review surface.
pub fn list_all(db: &LocalDb) -> CoreResult<Vec<QueuedRequest>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let mut stmt = conn.prepare(
        "SELECT id, kind, payload, status, last_error, attempts, enqueued_at, updated_at
         FROM request_queue
         ORDER BY enqueued_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], row_to_request)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Claim up to `limit` pending rows in enqueue order and mark them
/// `syncing`, bumping the attempt counter. Rows left `syncing` by a
/// previous claim are not re-claimed; `recover_stuck` resets those at
/// startup.
pub fn claim_pending(db: &LocalDb, limit: i64) -> CoreResult<Vec<QueuedRequest>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let mut stmt = conn.prepare(
        "SELECT id, kind, payload, status, last_error, attempts, enqueued_at, updated_at
         FROM request_queue
         WHERE status = 'pending'
         ORDER BY enqueued_at ASC, id ASC
         LIMIT ?1",
    )?;
    let mut items: Vec<QueuedRequest> = stmt
        .query_map(params![limit], row_to_request)?
        .filter_map(|r| r.ok())
        .collect();

    for item in &mut items {
        conn.execute(
            "UPDATE request_queue
             SET status = 'syncing', attempts = attempts + 1, updated_at = datetime('now')
             WHERE id = ?1",
            params![item.id],
        )?;
        item.status = RequestStatus::Syncing;
        item.attempts += 1;
    }

    Ok(items)
}

/// The backend accepted the request; drop it from the queue.
pub fn mark_synced(db: &LocalDb, id: &str) -> CoreResult<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    conn.execute("DELETE FROM request_queue WHERE id = ?1", params![id])?;
    debug!(request_id = %id, "Request synced and removed from queue");
    Ok(())
}

/// A retryable failure; put the row back to `pending` with the error
/// recorded. It stays eligible for every future flush, no backoff:
/// retry pressure is bounded by the flush cadence itself.
pub fn release(db: &LocalDb, id: &str, error: &str) -> CoreResult<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    conn.execute(
        "UPDATE request_queue
         SET status = 'pending', last_error = ?2, updated_at = datetime('now')
         WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}

/// The backend rejected the request; park it as `failed` until a human
/// retries or discards it.
pub fn mark_failed(db: &LocalDb, id: &str, error: &str) -> CoreResult<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    conn.execute(
        "UPDATE request_queue
         SET status = 'failed', last_error = ?2, updated_at = datetime('now')
         WHERE id = ?1",
        params![id, error],
    )?;
    warn!(request_id = %id, error = %error, "Request rejected by backend, marked failed");
    Ok(())
}

/// Manual retry of a failed row. Returns false when the id does not
/// name a failed row.
pub fn retry(db: &LocalDb, id: &str) -> CoreResult<bool> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let updated = conn.execute(
        "UPDATE request_queue
         SET status = 'pending', last_error = NULL, updated_at = datetime('now')
         WHERE id = ?1 AND status = 'failed'",
        params![id],
    )?;
    Ok(updated > 0)
}

/// Manual discard. Returns false when no row had that id.
pub fn discard(db: &LocalDb, id: &str) -> CoreResult<bool> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let deleted = conn.execute("DELETE FROM request_queue WHERE id = ?1", params![id])?;
    if deleted > 0 {
        info!(request_id = %id, "Queued request discarded");
    }
    Ok(deleted > 0)
}

/// Reset rows stuck in `syncing` from a crash mid-flush back to
/// `pending`. Called once at startup before the dispatcher runs.
pub fn recover_stuck(db: &LocalDb) -> CoreResult<usize> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let reset = conn.execute(
        "UPDATE request_queue
         SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'syncing'",
        [],
    )?;
    if reset > 0 {
        warn!(count = reset, "Recovered requests stuck in syncing state");
    }
    Ok(reset)
}

/// Row counts per status.
pub fn counts(db: &LocalDb) -> CoreResult<QueueCounts> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM request_queue GROUP BY status")?;
    let mut out = QueueCounts::default();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows.filter_map(|r| r.ok()) {
        match row.0.as_str() {
            "pending" => out.pending = row.1,
            "syncing" => out.syncing = row.1,
            "failed" => out.failed = row.1,
            _ => {}
        }
    }
    Ok(out)
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedRequest> {
    let kind_text: String = row.get(1)?;
    let payload_text: String = row.get(2)?;
    let status_text: String = row.get(3)?;
    Ok(QueuedRequest {
        id: row.get(0)?,
        kind: RequestKind::parse(&kind_text).unwrap_or(RequestKind::Receipt),
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
        status: RequestStatus::parse(&status_text).unwrap_or(RequestStatus::Pending),
        last_error: row.get(4)?,
        attempts: row.get(5)?,
        enqueued_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
