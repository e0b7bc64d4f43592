//! Optimistic catalog projections.
//!
//! One task owns the authoritative product/customer state, the pending
//! stock deltas, and the local cache tables. Everything reaches it as a
//! message: authoritative snapshots forwarded from the store
//! subscription, and queued/dropped receipt notes from the submit and
//! dispatch paths. It publishes display-ready lists on watch channels,
//! with pending receipt quantities riding on top of the authoritative
//! counts until the backend confirms them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::db::LocalDb;
use crate::error::{CoreError, CoreResult};
use crate::models::{Customer, Product, StockReceipt};
use crate::queue::{QueuedRequest, RequestKind, RequestStatus};
use crate::reconcile::DeltaMap;
use crate::store::{CollectionSnapshot, Doc};

const INBOX_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Projected entities
// ---------------------------------------------------------------------------

/// An entity the projection layer knows how to cache and publish.
pub trait Projected: Clone + Send + Serialize + DeserializeOwned + 'static {
    /// Store collection the authoritative copies live in.
    const COLLECTION: &'static str;
    /// Local cache table for restart-while-offline.
    const CACHE: &'static str;
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
}

impl Projected for Product {
    const COLLECTION: &'static str = "products";
    const CACHE: &'static str = "product_cache";
    fn id(&self) -> &str {
        &self.id
    }
    fn display_name(&self) -> &str {
        &self.name
    }
}

impl Projected for Customer {
    const COLLECTION: &'static str = "customers";
    const CACHE: &'static str = "customer_cache";
    fn id(&self) -> &str {
        &self.id
    }
    fn display_name(&self) -> &str {
        &self.name
    }
}

/// Parse snapshot docs into entities. The doc key is injected as `id`
/// when the payload does not repeat it. A malformed doc is skipped with
/// a warning; it must not take the rest of the catalog down with it.
pub fn parse_docs<T: Projected>(docs: &[Doc]) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| {
            let mut data = doc.data.clone();
            if let serde_json::Value::Object(map) = &mut data {
                map.entry("id")
                    .or_insert_with(|| serde_json::Value::String(doc.id.clone()));
            }
            match serde_json::from_value::<T>(data) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(
                        collection = T::COLLECTION,
                        doc_id = %doc.id,
                        error = %e,
                        "Skipping malformed document"
                    );
                    None
                }
            }
        })
        .collect()
}

fn sort_for_display<T: Projected>(list: &mut [T]) {
    list.sort_by(|a, b| {
        a.display_name()
            .to_lowercase()
            .cmp(&b.display_name().to_lowercase())
            .then_with(|| a.id().cmp(b.id()))
    });
}

// ---------------------------------------------------------------------------
// Local cache tables
// ---------------------------------------------------------------------------

/// Replace the cache table contents with the given authoritative list.
pub fn save_cache<T: Projected>(db: &LocalDb, items: &[T]) -> CoreResult<()> {
    let mut conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM {}", T::CACHE), [])?;
    for item in items {
        tx.execute(
            &format!(
                "INSERT INTO {} (id, data, updated_at) VALUES (?1, ?2, datetime('now'))",
                T::CACHE
            ),
            rusqlite::params![item.id(), serde_json::to_string(item)?],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Load the cached authoritative list, skipping rows that no longer parse.
pub fn load_cache<T: Projected>(db: &LocalDb) -> CoreResult<Vec<T>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;

    let mut stmt = conn.prepare(&format!("SELECT id, data FROM {} ORDER BY id", T::CACHE))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows.filter_map(|r| r.ok()) {
        match serde_json::from_str::<T>(&row.1) {
            Ok(item) => out.push(item),
            Err(e) => warn!(
                cache = T::CACHE,
                id = %row.0,
                error = %e,
                "Dropping unparseable cache row"
            ),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Delta rebuild
// ---------------------------------------------------------------------------

/// Rebuild pending deltas from receipts still sitting in the queue,
/// using the cached authoritative stock as the baseline. Failed rows are
/// excluded: their quantity is not on its way anywhere.
pub fn rebuild_deltas(rows: &[QueuedRequest], products: &[Product]) -> DeltaMap {
    let mut map = DeltaMap::new();
    for row in rows {
        if row.kind != RequestKind::Receipt || row.status == RequestStatus::Failed {
            continue;
        }
        match serde_json::from_value::<StockReceipt>(row.payload.clone()) {
            Ok(receipt) => {
                let baseline = products
                    .iter()
                    .find(|p| p.id == receipt.product_id)
                    .map(|p| p.stock_count)
                    .unwrap_or(0);
                map.note_queued(&receipt.product_id, baseline, receipt.qty);
            }
            Err(e) => warn!(
                request_id = %row.id,
                error = %e,
                "Skipping unparseable queued receipt during delta rebuild"
            ),
        }
    }
    map
}

// ---------------------------------------------------------------------------
// Projection task
// ---------------------------------------------------------------------------

/// Messages the projection task consumes.
#[derive(Debug, Clone)]
pub enum ProjectionMsg {
    /// Authoritative snapshot from the store subscription.
    Snapshot(CollectionSnapshot),
    /// A stock receipt was queued; start displaying its quantity.
    ReceiptQueued { product_id: String, qty: i64 },
    /// A queued receipt was rejected or discarded; its quantity will
    /// never be confirmed.
    ReceiptDropped { product_id: String, qty: i64 },
}

/// Handle the rest of the engine holds.
#[derive(Clone)]
pub struct ProjectionHandle {
    pub inbox: mpsc::Sender<ProjectionMsg>,
    pub products: watch::Receiver<Vec<Product>>,
    pub customers: watch::Receiver<Vec<Customer>>,
}

struct ProjectionState {
    db: Arc<LocalDb>,
    products: BTreeMap<String, Product>,
    customers: BTreeMap<String, Customer>,
    deltas: DeltaMap,
    products_tx: watch::Sender<Vec<Product>>,
    customers_tx: watch::Sender<Vec<Customer>>,
}

impl ProjectionState {
    fn displayed_products(&self) -> Vec<Product> {
        let mut list: Vec<Product> = self
            .products
            .values()
            .map(|p| {
                let mut p = p.clone();
                p.stock_count = self.deltas.displayed(&p.id, p.stock_count);
                p
            })
            .collect();
        sort_for_display(&mut list);
        list
    }

    fn publish_products(&self) {
        self.products_tx.send_replace(self.displayed_products());
    }

    fn publish_customers(&self) {
        let mut list: Vec<Customer> = self.customers.values().cloned().collect();
        sort_for_display(&mut list);
        self.customers_tx.send_replace(list);
    }

    fn apply_snapshot(&mut self, snap: CollectionSnapshot) {
        match snap.collection.as_str() {
            "products" => {
                let parsed: Vec<Product> = parse_docs(&snap.docs);
                self.products = parsed.into_iter().map(|p| (p.id.clone(), p)).collect();
                for (id, product) in &self.products {
                    self.deltas.reconcile(id, product.stock_count);
                }
                let authoritative: Vec<Product> = self.products.values().cloned().collect();
                if let Err(e) = save_cache(&self.db, &authoritative) {
                    warn!(error = %e, "Product cache write failed");
                }
                self.publish_products();
            }
            "customers" => {
                let parsed: Vec<Customer> = parse_docs(&snap.docs);
                self.customers = parsed.into_iter().map(|c| (c.id.clone(), c)).collect();
                let list: Vec<Customer> = self.customers.values().cloned().collect();
                if let Err(e) = save_cache(&self.db, &list) {
                    warn!(error = %e, "Customer cache write failed");
                }
                self.publish_customers();
            }
            other => debug!(collection = other, "Ignoring snapshot for collection"),
        }
    }

    fn handle(&mut self, msg: ProjectionMsg) {
        match msg {
            ProjectionMsg::Snapshot(snap) => self.apply_snapshot(snap),
            ProjectionMsg::ReceiptQueued { product_id, qty } => {
                let baseline = self
                    .products
                    .get(&product_id)
                    .map(|p| p.stock_count)
                    .unwrap_or(0);
                self.deltas.note_queued(&product_id, baseline, qty);
                self.publish_products();
            }
            ProjectionMsg::ReceiptDropped { product_id, qty } => {
                self.deltas.note_removed(&product_id, qty);
                self.publish_products();
            }
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<ProjectionMsg>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        debug!("Projection task stopped");
    }
}

/// Spawn the projection task. Initial lists come from the local caches;
/// `deltas` from [`rebuild_deltas`]. The watch channels start out with
/// the cached catalog, deltas already applied, so an offline restart has
/// data before the first snapshot arrives.
pub fn spawn(
    db: Arc<LocalDb>,
    initial_products: Vec<Product>,
    initial_customers: Vec<Customer>,
    deltas: DeltaMap,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> ProjectionHandle {
    let products: BTreeMap<String, Product> = initial_products
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();
    let customers: BTreeMap<String, Customer> = initial_customers
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();

    let mut initial_displayed: Vec<Product> = products
        .values()
        .map(|p| {
            let mut p = p.clone();
            p.stock_count = deltas.displayed(&p.id, p.stock_count);
            p
        })
        .collect();
    sort_for_display(&mut initial_displayed);
    let (products_tx, products_rx) = watch::channel(initial_displayed);

    let mut initial_customers: Vec<Customer> = customers.values().cloned().collect();
    sort_for_display(&mut initial_customers);
    let (customers_tx, customers_rx) = watch::channel(initial_customers);

    let state = ProjectionState {
        db,
        products,
        customers,
        deltas,
        products_tx,
        customers_tx,
    };

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    tracker.spawn(state.run(inbox_rx, cancel));

    ProjectionHandle {
        inbox: inbox_tx,
        products: products_rx,
        customers: customers_rx,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
