//! Queue dispatcher.
//!
//! One background task drains the offline request queue. It wakes on a
//! periodic tick, on a connectivity-restored signal from the monitor, on
//! a manual flush, and once at startup, then claims pending rows in
//! enqueue order and replays each against its backend callable. Items
//! are handled independently: a rejected row is parked as failed and the
//! flush moves on, so one bad payload never blocks the queue behind it.
//! Transient failures go straight back to pending; they retry on every
//! future flush, rate-limited only by the flush cadence.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::CallableBackend;
use crate::connectivity::ConnState;
use crate::db::LocalDb;
use crate::error::CoreResult;
use crate::models::StockReceipt;
use crate::notify::{NoticeBus, NoticeLevel};
use crate::projection::ProjectionMsg;
use crate::queue::{self, QueuedRequest, RequestKind};

const FLUSH_CHANNEL_CAPACITY: usize = 8;

/// Why a flush is running. Scheduled ticks defer to the connectivity
/// monitor; the other reasons always attempt the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Startup,
    BackOnline,
    Tick,
    Manual,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Startup => "startup",
            FlushReason::BackOnline => "back_online",
            FlushReason::Tick => "tick",
            FlushReason::Manual => "manual",
        }
    }
}

/// Snapshot of the sync surface, published after every cycle.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SyncStatus {
    pub online: bool,
    /// Rows waiting to sync, in-flight ones included.
    pub pending: i64,
    pub failed: i64,
    pub last_sync: Option<String>,
}

/// What the engine holds after spawning the dispatcher: the flush signal
/// sender (shared with the connectivity monitor and flush_now) and the
/// sync status watch.
#[derive(Clone)]
pub struct DispatcherHandle {
    pub flush_tx: mpsc::Sender<FlushReason>,
    pub status: watch::Receiver<SyncStatus>,
}

/// Create the flush signal channel. The sender also goes to the
/// connectivity monitor so restored connectivity can trigger a flush;
/// both ends then go to [`spawn`].
pub fn flush_channel() -> (mpsc::Sender<FlushReason>, mpsc::Receiver<FlushReason>) {
    mpsc::channel(FLUSH_CHANNEL_CAPACITY)
}

pub fn spawn(
    db: Arc<LocalDb>,
    backend: Arc<dyn CallableBackend>,
    conn_state: watch::Receiver<ConnState>,
    projection: mpsc::Sender<ProjectionMsg>,
    notices: NoticeBus,
    flush_tx: mpsc::Sender<FlushReason>,
    mut flush_rx: mpsc::Receiver<FlushReason>,
    flush_interval: Duration,
    claim_batch: i64,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> DispatcherHandle {
    let initial = status_snapshot(&db, conn_state.borrow().is_online(), &None);
    let (status_tx, status_rx) = watch::channel(initial);

    tracker.spawn(async move {
        info!("Dispatcher started (flush interval: {:?})", flush_interval);
        let mut last_sync: Option<String> = None;

        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(flush_interval) => FlushReason::Tick,
                msg = flush_rx.recv() => match msg {
                    Some(reason) => reason,
                    None => break,
                },
            };

            let online = conn_state.borrow().is_online();
            if reason == FlushReason::Tick && !online {
                debug!("Skipping scheduled flush while offline");
                publish_status(&db, &status_tx, false, &last_sync);
                continue;
            }

            match run_flush(&db, backend.as_ref(), &projection, &notices, claim_batch).await {
                Ok(synced) => {
                    if synced > 0 {
                        last_sync = Some(Utc::now().to_rfc3339());
                        info!(
                            synced,
                            reason = reason.as_str(),
                            "Flush complete"
                        );
                    }
                }
                Err(e) => warn!(reason = reason.as_str(), error = %e, "Flush failed"),
            }

            publish_status(&db, &status_tx, conn_state.borrow().is_online(), &last_sync);
        }
        debug!("Dispatcher stopped");
    });

    DispatcherHandle {
        flush_tx,
        status: status_rx,
    }
}

// ---------------------------------------------------------------------------
// Flush cycle
// ---------------------------------------------------------------------------

/// Claim a batch of pending rows and replay them one by one. Returns how
/// many synced.
async fn run_flush(
    db: &LocalDb,
    backend: &dyn CallableBackend,
    projection: &mpsc::Sender<ProjectionMsg>,
    notices: &NoticeBus,
    claim_batch: i64,
) -> CoreResult<usize> {
    let items = queue::claim_pending(db, claim_batch)?;
    if items.is_empty() {
        return Ok(0);
    }
    info!(count = items.len(), "Flushing queued requests");

    let mut synced = 0;
    for item in items {
        match replay_item(backend, &item).await {
            Ok(()) => {
                queue::mark_synced(db, &item.id)?;
                synced += 1;
                let message = match item.kind {
                    RequestKind::Sale => "Queued sale synced.",
                    RequestKind::Receipt => "Queued stock receipt synced.",
                };
                notices.post(NoticeLevel::Success, message);
            }
            Err(err) if err.is_retryable() => {
                debug!(request_id = %item.id, error = %err, "Replay hit a transient failure");
                queue::release(db, &item.id, &err.to_string())?;
            }
            Err(err) => {
                queue::mark_failed(db, &item.id, &err.to_string())?;
                let message = match item.kind {
                    RequestKind::Sale => format!("Queued sale was rejected: {err}"),
                    RequestKind::Receipt => format!("Queued stock receipt was rejected: {err}"),
                };
                notices.post(NoticeLevel::Error, message);
                drop_projected_receipt(projection, &item).await;
            }
        }
    }
    Ok(synced)
}

/// Replay one request against its callable, forwarding the row id as the
/// idempotency key so a lost response cannot double-apply.
async fn replay_item(backend: &dyn CallableBackend, item: &QueuedRequest) -> CoreResult<()> {
    let callable = match item.kind {
        RequestKind::Sale => "commitSale",
        RequestKind::Receipt => "receiveStock",
    };

    let mut payload = item.payload.clone();
    if let Value::Object(map) = &mut payload {
        map.insert("idempotency_key".to_string(), Value::String(item.id.clone()));
    }

    backend.invoke(callable, &payload).await.map(|_| ())
}

/// A rejected receipt's quantity will never be confirmed; tell the
/// projection to stop displaying it.
async fn drop_projected_receipt(projection: &mpsc::Sender<ProjectionMsg>, item: &QueuedRequest) {
    if item.kind != RequestKind::Receipt {
        return;
    }
    match serde_json::from_value::<StockReceipt>(item.payload.clone()) {
        Ok(receipt) => {
            let _ = projection
                .send(ProjectionMsg::ReceiptDropped {
                    product_id: receipt.product_id,
                    qty: receipt.qty,
                })
                .await;
        }
        Err(e) => warn!(request_id = %item.id, error = %e, "Rejected receipt payload did not parse"),
    }
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

fn status_snapshot(db: &LocalDb, online: bool, last_sync: &Option<String>) -> SyncStatus {
    let counts = queue::counts(db).unwrap_or_default();
    SyncStatus {
        online,
        pending: counts.pending + counts.syncing,
        failed: counts.failed,
        last_sync: last_sync.clone(),
    }
}

fn publish_status(
    db: &LocalDb,
    status_tx: &watch::Sender<SyncStatus>,
    online: bool,
    last_sync: &Option<String>,
) {
    let status = status_snapshot(db, online, last_sync);
    status_tx.send_if_modified(|current| {
        if *current != status {
            *current = status;
            true
        } else {
            false
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
