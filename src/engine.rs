//! Engine wiring.
//!
//! `Engine::start` is the one place everything is constructed and
//! connected: the per-workspace database, the projection task, the
//! connectivity monitor, and the queue dispatcher. The embedding app
//! holds the `Engine` and talks to it through explicit methods; there is
//! no ambient global state anywhere in the crate.
//!
//! The submit paths are the operation boundaries from the error design:
//! recoverable failures become notices (and, for receipts, queue rows),
//! rejections surface to the caller, and nothing bubbles into a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::CallableBackend;
use crate::connectivity::{self, ConnState};
use crate::db::{self, LocalDb};
use crate::dispatcher::{self, DispatcherHandle, FlushReason, SyncStatus};
use crate::error::{CoreError, CoreResult};
use crate::models::{Customer, Product, Sale, SaleDraft, StockReceipt};
use crate::notify::{NoticeBus, NoticeEvent, NoticeLevel};
use crate::projection::{self, ProjectionHandle, ProjectionMsg};
use crate::queue::{self, QueuedRequest, RequestKind, RequestStatus};
use crate::sale;
use crate::session::{EngineConfig, Pairing};
use crate::store::DocumentStore;

/// How a receipt submission ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The backend confirmed the operation synchronously.
    Sent,
    /// The operation is queued and will sync when connectivity allows.
    Queued { request_id: String },
}

pub struct Engine {
    db: Arc<LocalDb>,
    store: Arc<dyn DocumentStore>,
    backend: Arc<dyn CallableBackend>,
    notices: NoticeBus,
    online_hint: Arc<AtomicBool>,
    conn_state: watch::Receiver<ConnState>,
    projection: ProjectionHandle,
    dispatcher: DispatcherHandle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Engine {
    /// Bring the engine up for one paired workspace.
    ///
    /// Opens (or degrades) the local database, loads the cached catalog,
    /// rebuilds pending deltas from still-queued receipts, spawns the
    /// background tasks, and requests an initial flush so anything queued
    /// before the last shutdown replays right away.
    pub async fn start(
        pairing: Pairing,
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        backend: Arc<dyn CallableBackend>,
    ) -> CoreResult<Self> {
        info!(
            workspace = %pairing.workspace_id,
            backend = %pairing.backend_url,
            "Starting Brightcart engine"
        );

        let workspace_dir = pairing.workspace_dir(&config.data_dir);
        let local = Arc::new(db::open_or_memory(&workspace_dir)?);

        let recovered = queue::recover_stuck(&local)?;
        if recovered > 0 {
            info!(count = recovered, "Requeued requests left in flight by a previous run");
        }

        let cached_products: Vec<Product> = projection::load_cache(&local)?;
        let cached_customers: Vec<Customer> = projection::load_cache(&local)?;
        let deltas = projection::rebuild_deltas(&queue::list_all(&local)?, &cached_products);

        let notices = NoticeBus::default();
        let online_hint = Arc::new(AtomicBool::new(true));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let projection = projection::spawn(
            Arc::clone(&local),
            cached_products,
            cached_customers,
            deltas,
            &tracker,
            cancel.clone(),
        );

        for collection in ["products", "customers"] {
            spawn_snapshot_forwarder(
                Arc::clone(&store),
                collection,
                projection.inbox.clone(),
                &tracker,
                cancel.clone(),
            )
            .await?;
        }

        let (flush_tx, flush_rx) = dispatcher::flush_channel();

        let conn_state = connectivity::spawn(
            Arc::clone(&backend),
            Arc::clone(&online_hint),
            config.heartbeat_interval,
            flush_tx.clone(),
            notices.clone(),
            &tracker,
            cancel.clone(),
        );

        let dispatcher = dispatcher::spawn(
            Arc::clone(&local),
            Arc::clone(&backend),
            conn_state.clone(),
            projection.inbox.clone(),
            notices.clone(),
            flush_tx,
            flush_rx,
            config.flush_interval,
            config.claim_batch,
            &tracker,
            cancel.clone(),
        );

        let _ = dispatcher.flush_tx.try_send(FlushReason::Startup);

        Ok(Self {
            db: local,
            store,
            backend,
            notices,
            online_hint,
            conn_state,
            projection,
            dispatcher,
            tracker,
            cancel,
        })
    }

    // -----------------------------------------------------------------------
    // Operation boundaries
    // -----------------------------------------------------------------------

    /// Record a sale. Sales are confirmed synchronously; the cashier needs
    /// the totals and change due before goods leave the counter, so this
    /// path never falls back to the queue. Offline, the caller gets an
    /// `Offline` error and keeps the draft for a retry with the same id.
    pub async fn submit_sale(&self, draft: &SaleDraft) -> CoreResult<Sale> {
        if !self.online_hint.load(Ordering::SeqCst) {
            return Err(CoreError::Offline(
                "Cannot record a sale while offline".into(),
            ));
        }

        match sale::record_sale(self.store.as_ref(), &self.db, draft).await {
            Ok(sale) => {
                self.notices
                    .post(NoticeLevel::Success, format!("Sale {} recorded.", sale.number));
                Ok(sale)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.notices.post(
                        NoticeLevel::Warning,
                        "Could not reach the backend. The sale was not recorded.",
                    );
                }
                Err(e)
            }
        }
    }

    /// Record a stock receipt. Tries the backend when the register counts
    /// as online; an unreachable backend or a host-reported offline state
    /// queues the receipt instead and bumps the displayed stock.
    pub async fn submit_receipt(&self, receipt: &StockReceipt) -> CoreResult<SubmitOutcome> {
        receipt.validate()?;

        let id = Uuid::new_v4().to_string();
        let mut payload = serde_json::to_value(receipt)?;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert(
                "idempotency_key".to_string(),
                serde_json::Value::String(id.clone()),
            );
        }

        if !self.online_hint.load(Ordering::SeqCst) {
            return self.queue_receipt(&id, receipt, &payload).await;
        }

        match self.backend.invoke("receiveStock", &payload).await {
            Ok(_) => {
                self.notices
                    .post(NoticeLevel::Success, "Stock receipt recorded.");
                Ok(SubmitOutcome::Sent)
            }
            Err(e) if e.is_retryable() => {
                info!(request_id = %id, error = %e, "Receipt hit a transient failure, queuing");
                self.queue_receipt(&id, receipt, &payload).await
            }
            Err(e) => {
                self.notices
                    .post(NoticeLevel::Error, format!("Stock receipt rejected: {e}"));
                Err(e)
            }
        }
    }

    async fn queue_receipt(
        &self,
        id: &str,
        receipt: &StockReceipt,
        payload: &serde_json::Value,
    ) -> CoreResult<SubmitOutcome> {
        queue::enqueue(&self.db, id, RequestKind::Receipt, payload)?;
        let _ = self
            .projection
            .inbox
            .send(ProjectionMsg::ReceiptQueued {
                product_id: receipt.product_id.clone(),
                qty: receipt.qty,
            })
            .await;
        self.notices.post(
            NoticeLevel::Info,
            "Stock receipt queued. It will sync when you are back online.",
        );
        Ok(SubmitOutcome::Queued {
            request_id: id.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Read surfaces
    // -----------------------------------------------------------------------

    /// Display-ready product list: authoritative counts with pending
    /// receipt quantities riding on top.
    pub fn products(&self) -> watch::Receiver<Vec<Product>> {
        self.projection.products.clone()
    }

    pub fn customers(&self) -> watch::Receiver<Vec<Customer>> {
        self.projection.customers.clone()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.dispatcher.status.clone()
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnState> {
        self.conn_state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<NoticeEvent> {
        self.notices.subscribe()
    }

    /// Everything still in the queue, for the sync review screen.
    pub fn pending_requests(&self) -> CoreResult<Vec<QueuedRequest>> {
        queue::list_all(&self.db)
    }

    // -----------------------------------------------------------------------
    // Queue management
    // -----------------------------------------------------------------------

    /// Put a failed request back in line and ask for a flush.
    pub fn retry_request(&self, id: &str) -> CoreResult<bool> {
        let retried = queue::retry(&self.db, id)?;
        if retried {
            let _ = self.dispatcher.flush_tx.try_send(FlushReason::Manual);
        }
        Ok(retried)
    }

    /// Drop a queued request for good. A still-pending receipt also stops
    /// displaying its quantity; a failed one already did when it was
    /// rejected.
    pub async fn discard_request(&self, id: &str) -> CoreResult<bool> {
        let row = self
            .pending_requests()?
            .into_iter()
            .find(|r| r.id == id);
        let discarded = queue::discard(&self.db, id)?;

        if discarded {
            if let Some(row) = row {
                if row.kind == RequestKind::Receipt && row.status != RequestStatus::Failed {
                    if let Ok(receipt) = serde_json::from_value::<StockReceipt>(row.payload) {
                        let _ = self
                            .projection
                            .inbox
                            .send(ProjectionMsg::ReceiptDropped {
                                product_id: receipt.product_id,
                                qty: receipt.qty,
                            })
                            .await;
                    }
                }
            }
        }
        Ok(discarded)
    }

    /// Host-provided navigator-style online flag. False short-circuits
    /// every submission straight to the queue.
    pub fn set_online_hint(&self, online: bool) {
        self.online_hint.store(online, Ordering::SeqCst);
    }

    /// Ask the dispatcher for a flush outside its normal cadence.
    pub fn flush_now(&self) {
        let _ = self.dispatcher.flush_tx.try_send(FlushReason::Manual);
    }

    /// Stop the background tasks. An in-flight replay finishes its current
    /// item; nothing new starts.
    pub async fn shutdown(self) {
        info!("Shutting down Brightcart engine");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Subscribe to a store collection and feed its snapshots into the
/// projection inbox. The subscription's current docs go in first so the
/// projection starts from authoritative data, not just the local cache.
async fn spawn_snapshot_forwarder(
    store: Arc<dyn DocumentStore>,
    collection: &'static str,
    inbox: tokio::sync::mpsc::Sender<ProjectionMsg>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let (initial, mut rx) = store.subscribe(collection).await?;

    tracker.spawn(async move {
        let _ = inbox
            .send(ProjectionMsg::Snapshot(crate::store::CollectionSnapshot {
                collection: collection.to_string(),
                docs: initial,
            }))
            .await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                snap = rx.recv() => match snap {
                    Ok(snap) => {
                        let _ = inbox.send(ProjectionMsg::Snapshot(snap)).await;
                    }
                    // Snapshots are self-contained; after a lag the next
                    // one restores the full picture.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(collection, skipped, "Snapshot subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
