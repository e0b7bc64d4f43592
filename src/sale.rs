//! Transactional sale recorder.
//!
//! A sale and everything it touches commits in one document-store
//! transaction: the sale document, one item document per line, one
//! ledger entry per line, and every referenced product's decremented
//! stock. The draft id is the idempotency key; a second submit of the
//! same id finds the sale document already present and aborts without
//! writing anything. Insufficient stock is not a failure here: counts
//! may go negative and get cleaned up through a later receipt.

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, LocalDb};
use crate::error::{CoreError, CoreResult};
use crate::models::{validate_lines, Sale, SaleDraft, SaleItem, StockLedgerEntry, StockMovement};
use crate::store::{DocumentStore, TransactionView};

const SALES: &str = "sales";
const SALE_ITEMS: &str = "sale_items";
const STOCK_LEDGER: &str = "stock_ledger";
const PRODUCTS: &str = "products";

/// Record a sale draft. Returns the recorded sale on success.
///
/// Duplicate and validation failures abort before any write; a
/// transient store failure surfaces as `Offline` and the caller decides
/// whether to retry the same draft id.
pub async fn record_sale(
    store: &dyn DocumentStore,
    local: &LocalDb,
    draft: &SaleDraft,
) -> CoreResult<Sale> {
    if draft.id.trim().is_empty() {
        return Err(CoreError::Validation("Sale id must not be empty".into()));
    }

    // The human-facing number comes from the local per-workspace counter.
    // A number burned by a failed transaction leaves a gap, which is fine.
    let number = {
        let conn = local
            .conn
            .lock()
            .map_err(|e| CoreError::Internal(format!("db lock: {e}")))?;
        db::next_sale_number(&conn)
    };

    let mut recorded: Option<Sale> = None;
    store
        .run_transaction(Box::new(|tx| {
            recorded = Some(commit_sale(tx, draft, &number)?);
            Ok(())
        }))
        .await?;

    let sale = recorded
        .ok_or_else(|| CoreError::Internal("sale transaction returned no record".into()))?;
    info!(
        sale_id = %sale.id,
        number = %sale.number,
        total = sale.totals.total,
        "Sale recorded"
    );
    Ok(sale)
}

/// The transaction body: guard, validate, read products, buffer writes.
fn commit_sale(tx: &mut dyn TransactionView, draft: &SaleDraft, number: &str) -> CoreResult<Sale> {
    // Idempotency guard. A lost response followed by a retry of the same
    // draft lands here and changes nothing.
    if tx.get(SALES, &draft.id)?.is_some() {
        return Err(CoreError::DuplicateSale(draft.id.clone()));
    }

    validate_lines(&draft.lines)?;

    let recorded_at = Utc::now();
    for (idx, line) in draft.lines.iter().enumerate() {
        let line_no = (idx + 1) as u32;

        // Repeated reads see this transaction's earlier writes, so two
        // lines of the same product decrement cumulatively.
        let mut product = tx.get(PRODUCTS, &line.product_id)?.ok_or_else(|| {
            CoreError::Rejected(format!("Unknown product {} on line {line_no}", line.product_id))
        })?;
        let fields = product
            .as_object_mut()
            .ok_or_else(|| CoreError::Internal(format!("product {} is not an object", line.product_id)))?;

        let current = fields
            .get("stock_count")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        fields.insert("stock_count".into(), Value::from(current - line.qty));
        fields.insert(
            "updated_at".into(),
            serde_json::to_value(recorded_at)?,
        );
        tx.set(PRODUCTS, &line.product_id, product);

        let item = SaleItem {
            sale_id: draft.id.clone(),
            line_no,
            product_id: line.product_id.clone(),
            name: line.name.clone(),
            qty: line.qty,
            unit_price: line.unit_price,
            line_total: line.qty as f64 * line.unit_price,
        };
        tx.set(
            SALE_ITEMS,
            &format!("{}:{line_no}", draft.id),
            serde_json::to_value(&item)?,
        );

        let entry = StockLedgerEntry {
            id: Uuid::new_v4().to_string(),
            product_id: line.product_id.clone(),
            qty_delta: -line.qty,
            reason: StockMovement::Sale,
            ref_id: draft.id.clone(),
            recorded_at,
        };
        tx.set(STOCK_LEDGER, &entry.id, serde_json::to_value(&entry)?);
    }

    let sale = Sale {
        id: draft.id.clone(),
        number: number.to_string(),
        line_count: draft.lines.len() as u32,
        totals: draft.totals,
        payment: draft.payment.clone(),
        customer_id: draft.customer_id.clone(),
        recorded_at,
    };
    tx.set(SALES, &draft.id, serde_json::to_value(&sale)?);
    Ok(sale)
}

// ===========================================================================
// Tests
// ===========================================================================
