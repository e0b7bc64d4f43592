//! Domain records shared across the engine.
//!
//! The backend owns the authoritative copies of products and customers; the
//! engine holds cached/projected copies only. Sales and their satellite
//! documents are written once by the recorder and never mutated after.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

/// A product as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    /// Unit price in the store currency.
    pub price: f64,
    pub stock_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A customer record; projected for the sale screen's lookup list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkout input
// ---------------------------------------------------------------------------

/// One cart line as submitted at checkout. `name` is denormalised so the
/// sale items stay readable after a product rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,
    pub name: String,
    pub qty: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub method: PaymentMethod,
    pub amount_tendered: Option<f64>,
    pub change_due: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SaleTotals {
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

/// What checkout hands to the engine. `id` is client-generated up front and
/// doubles as the idempotency key for the whole transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleDraft {
    pub id: String,
    pub lines: Vec<CartLine>,
    pub totals: SaleTotals,
    pub payment: Payment,
    pub customer_id: Option<String>,
}

impl SaleDraft {
    /// Generate a fresh draft id. Call once per checkout attempt and reuse
    /// the same id across retries of that attempt.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

// ---------------------------------------------------------------------------
// Recorded documents
// ---------------------------------------------------------------------------

/// The sale document. Line detail lives in [`SaleItem`] documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    /// Human-facing sequential number, e.g. `S-23082026-00042`.
    pub number: String,
    pub line_count: u32,
    pub totals: SaleTotals,
    pub payment: Payment,
    pub customer_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
    pub sale_id: String,
    pub line_no: u32,
    pub product_id: String,
    pub name: String,
    pub qty: i64,
    pub unit_price: f64,
    pub line_total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockMovement {
    Sale,
    Receipt,
}

/// One row of the stock audit trail. `qty_delta` is negative for sales,
/// positive for receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    pub id: String,
    pub product_id: String,
    pub qty_delta: i64,
    pub reason: StockMovement,
    /// Sale or receipt id this movement belongs to.
    pub ref_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Payload of the receiveStock callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReceipt {
    pub product_id: String,
    pub qty: i64,
    pub supplier: String,
    pub unit_cost: Option<f64>,
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate cart lines ahead of the sale transaction. An empty cart, a
/// blank product id, a non-positive quantity, or a negative price all fail.
pub fn validate_lines(lines: &[CartLine]) -> CoreResult<()> {
    if lines.is_empty() {
        return Err(CoreError::Validation("cart is empty".into()));
    }
    for (idx, line) in lines.iter().enumerate() {
        if line.product_id.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "line {}: missing product id",
                idx + 1
            )));
        }
        if line.qty <= 0 {
            return Err(CoreError::Validation(format!(
                "line {}: quantity must be positive (got {})",
                idx + 1,
                line.qty
            )));
        }
        if line.unit_price < 0.0 {
            return Err(CoreError::Validation(format!(
                "line {}: price cannot be negative",
                idx + 1
            )));
        }
    }
    Ok(())
}

impl StockReceipt {
    /// Validate a receipt before it is sent or queued. Failures here stay
    /// inline — they never reach the queue or the backend.
    pub fn validate(&self) -> CoreResult<()> {
        if self.product_id.trim().is_empty() {
            return Err(CoreError::Validation("missing product id".into()));
        }
        if self.qty <= 0 {
            return Err(CoreError::Validation(format!(
                "quantity must be positive (got {})",
                self.qty
            )));
        }
        if self.supplier.trim().is_empty() {
            return Err(CoreError::Validation("supplier is required".into()));
        }
        if let Some(cost) = self.unit_cost {
            if cost < 0.0 {
                return Err(CoreError::Validation("unit cost cannot be negative".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product_id: &str, qty: i64, unit_price: f64) -> CartLine {
        CartLine {
            product_id: product_id.into(),
            name: "Test item".into(),
            qty,
            unit_price,
        }
    }

    #[test]
    fn test_validate_lines_accepts_normal_cart() {
        let lines = vec![line("p-1", 2, 1.5), line("p-2", 1, 0.0)];
        assert!(validate_lines(&lines).is_ok());
    }

    #[test]
    fn test_validate_lines_rejects_empty_cart() {
        let err = validate_lines(&[]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_validate_lines_rejects_bad_lines() {
        assert!(validate_lines(&[line("", 1, 1.0)]).is_err());
        assert!(validate_lines(&[line("p-1", 0, 1.0)]).is_err());
        assert!(validate_lines(&[line("p-1", -3, 1.0)]).is_err());
        assert!(validate_lines(&[line("p-1", 1, -0.01)]).is_err());
    }

    #[test]
    fn test_validate_lines_reports_offending_line() {
        let lines = vec![line("p-1", 1, 1.0), line("p-2", -1, 1.0)];
        let err = validate_lines(&lines).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_receipt_validation() {
        let good = StockReceipt {
            product_id: "p-1".into(),
            qty: 5,
            supplier: "Acme Wholesale".into(),
            unit_cost: Some(2.0),
            note: None,
        };
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.qty = 0;
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.supplier = "   ".into();
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.unit_cost = Some(-1.0);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_payment_method_serializes_snake_case() {
        let json = serde_json::to_string(&PaymentMethod::Card).unwrap();
        assert_eq!(json, "\"card\"");
    }
}
