//! Pending-delta arithmetic for optimistic stock display.
//!
//! A stock receipt that is queued offline should show up in the product
//! list immediately, then dissolve into the authoritative count once the
//! backend confirms it. Each product with unconfirmed receipts carries a
//! `PendingDelta`; authoritative snapshots are folded through it so the
//! confirmed part is absorbed exactly once and the unconfirmed remainder
//! keeps riding on top. No timestamps, no operation log replay, just the
//! baseline captured at queue time.

use std::collections::HashMap;

/// Unconfirmed stock increase for one product.
///
/// `baseline` is the authoritative count known when the first queued
/// receipt was recorded; `increment` is the total quantity still
/// awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    pub baseline: i64,
    pub increment: i64,
}

impl PendingDelta {
    pub fn new(baseline: i64, increment: i64) -> Self {
        Self {
            baseline,
            increment,
        }
    }

    /// Fold an authoritative count through the delta.
    ///
    /// Whatever the backend has applied since `baseline` is treated as
    /// confirmation of the queued quantity. A decrease below baseline
    /// (say a sale landing while the receipt is still queued) must not
    /// eat the unconfirmed increment, hence the clamp of `applied` at
    /// zero. Returns None once the whole increment is accounted for.
    pub fn reconcile(self, actual: i64) -> Option<PendingDelta> {
        let applied = actual - self.baseline;
        if applied >= self.increment {
            return None;
        }
        let remaining = self.increment - applied.max(0);
        Some(PendingDelta {
            baseline: actual,
            increment: remaining,
        })
    }

    /// Count to display while the delta is outstanding.
    pub fn displayed(&self, actual: i64) -> i64 {
        (actual + self.increment).max(0)
    }
}

// ---------------------------------------------------------------------------
// Per-product delta map
// ---------------------------------------------------------------------------

/// All outstanding deltas, keyed by product id. Owned by the projection
/// task; nothing else mutates it.
#[derive(Debug, Default)]
pub struct DeltaMap {
    inner: HashMap<String, PendingDelta>,
}

impl DeltaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, product_id: &str) -> Option<&PendingDelta> {
        self.inner.get(product_id)
    }

    /// A receipt for `product_id` was queued. The first queued receipt
    /// pins the baseline; later ones just add to the increment.
    pub fn note_queued(&mut self, product_id: &str, baseline: i64, qty: i64) {
        self.inner
            .entry(product_id.to_string())
            .and_modify(|d| d.increment += qty)
            .or_insert_with(|| PendingDelta::new(baseline, qty));
    }

    /// A queued receipt was rejected or discarded; its quantity will
    /// never be confirmed, so stop displaying it.
    pub fn note_removed(&mut self, product_id: &str, qty: i64) {
        if let Some(delta) = self.inner.get_mut(product_id) {
            delta.increment -= qty;
            if delta.increment <= 0 {
                self.inner.remove(product_id);
            }
        }
    }

    /// Fold an authoritative count for `product_id` through its delta.
    pub fn reconcile(&mut self, product_id: &str, actual: i64) {
        if let Some(delta) = self.inner.remove(product_id) {
            if let Some(rest) = delta.reconcile(actual) {
                self.inner.insert(product_id.to_string(), rest);
            }
        }
    }

    /// Count to display for `product_id` given its authoritative count.
    pub fn displayed(&self, product_id: &str, actual: i64) -> i64 {
        match self.inner.get(product_id) {
            Some(delta) => delta.displayed(actual),
            None => actual,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
