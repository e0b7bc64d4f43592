//! Document store seam.
//!
//! The engine keeps authoritative data (products, sales, ledger) in a
//! hosted document store. `DocumentStore` is the trait the engine codes
//! against: keyed documents grouped in named collections, atomic
//! transactions over a buffered view, and live full-collection snapshots
//! in commit order. `MemoryStore` is the in-process implementation used
//! by tests and by dev setups without a backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::{CoreError, CoreResult};

/// One document with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    pub data: Value,
}

/// Full state of a collection after a commit. Snapshots are
/// self-contained, so a subscriber that lags and drops some may apply
/// only the latest and still be correct.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub collection: String,
    pub docs: Vec<Doc>,
}

/// Buffered view the transaction closure works against. Reads see the
/// transaction's own writes; nothing touches the store until the
/// closure returns Ok.
pub trait TransactionView {
    fn get(&mut self, collection: &str, id: &str) -> CoreResult<Option<Value>>;
    fn set(&mut self, collection: &str, id: &str, doc: Value);
    fn delete(&mut self, collection: &str, id: &str);
}

/// Transaction body. Runs on the store's thread of control; must not
/// have side effects outside the view, since an implementation may
/// retry it on contention.
pub type TxFn<'a> = Box<dyn FnOnce(&mut dyn TransactionView) -> CoreResult<()> + Send + 'a>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Value>>;
    async fn set(&self, collection: &str, id: &str, doc: Value) -> CoreResult<()>;
    /// Shallow-merge `patch` (a JSON object) into an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> CoreResult<()>;
    async fn delete(&self, collection: &str, id: &str) -> CoreResult<()>;
    /// Run `f` atomically: all of its writes commit or none do.
    async fn run_transaction<'a>(&self, f: TxFn<'a>) -> CoreResult<()>;
    /// Current docs plus a receiver of post-commit snapshots, in commit
    /// order.
    async fn subscribe(
        &self,
        collection: &str,
    ) -> CoreResult<(Vec<Doc>, broadcast::Receiver<CollectionSnapshot>)>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Mutexed map of collections with broadcast snapshots. A transaction
/// holds the map lock for its whole body, which serialises writers and
/// makes publish order equal commit order.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    watchers: Mutex<HashMap<String, broadcast::Sender<CollectionSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_collections(
        &self,
    ) -> CoreResult<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>>> {
        self.collections
            .lock()
            .map_err(|e| CoreError::Internal(format!("store lock: {e}")))
    }

    fn docs_of(map: &HashMap<String, BTreeMap<String, Value>>, collection: &str) -> Vec<Doc> {
        map.get(collection)
            .map(|coll| {
                coll.iter()
                    .map(|(id, data)| Doc {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send fresh snapshots for the touched collections. Called with the
    /// collections lock held so concurrent commits cannot reorder.
    fn publish(&self, map: &HashMap<String, BTreeMap<String, Value>>, touched: &[String]) {
        let watchers = match self.watchers.lock() {
            Ok(w) => w,
            Err(_) => return,
        };
        for collection in touched {
            if let Some(tx) = watchers.get(collection) {
                let _ = tx.send(CollectionSnapshot {
                    collection: collection.clone(),
                    docs: Self::docs_of(map, collection),
                });
            }
        }
    }
}

struct MemTransaction<'a> {
    base: &'a HashMap<String, BTreeMap<String, Value>>,
    // (collection, id, doc); None = delete. Later entries win.
    writes: Vec<(String, String, Option<Value>)>,
}

impl TransactionView for MemTransaction<'_> {
    fn get(&mut self, collection: &str, id: &str) -> CoreResult<Option<Value>> {
        for (c, i, doc) in self.writes.iter().rev() {
            if c == collection && i == id {
                return Ok(doc.clone());
            }
        }
        Ok(self
            .base
            .get(collection)
            .and_then(|coll| coll.get(id))
            .cloned())
    }

    fn set(&mut self, collection: &str, id: &str, doc: Value) {
        self.writes
            .push((collection.to_string(), id.to_string(), Some(doc)));
    }

    fn delete(&mut self, collection: &str, id: &str) {
        self.writes
            .push((collection.to_string(), id.to_string(), None));
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Value>> {
        let map = self.lock_collections()?;
        Ok(map.get(collection).and_then(|coll| coll.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> CoreResult<()> {
        let mut map = self.lock_collections()?;
        map.entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        self.publish(&map, &[collection.to_string()]);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> CoreResult<()> {
        let patch = match patch {
            Value::Object(fields) => fields,
            _ => {
                return Err(CoreError::Internal(
                    "update patch must be a JSON object".into(),
                ))
            }
        };

        let mut map = self.lock_collections()?;
        let doc = map
            .get_mut(collection)
            .and_then(|coll| coll.get_mut(id))
            .ok_or_else(|| CoreError::Storage(format!("update on missing doc {collection}/{id}")))?;

        match doc {
            Value::Object(fields) => {
                for (k, v) in patch {
                    fields.insert(k, v);
                }
            }
            other => *other = Value::Object(patch),
        }
        self.publish(&map, &[collection.to_string()]);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> CoreResult<()> {
        let mut map = self.lock_collections()?;
        if let Some(coll) = map.get_mut(collection) {
            coll.remove(id);
        }
        self.publish(&map, &[collection.to_string()]);
        Ok(())
    }

    async fn run_transaction<'a>(&self, f: TxFn<'a>) -> CoreResult<()> {
        let mut map = self.lock_collections()?;

        let mut tx = MemTransaction {
            base: &map,
            writes: Vec::new(),
        };
        f(&mut tx)?;
        let writes = tx.writes;

        let mut touched: Vec<String> = Vec::new();
        for (collection, id, doc) in writes {
            let coll = map.entry(collection.clone()).or_default();
            match doc {
                Some(d) => {
                    coll.insert(id, d);
                }
                None => {
                    coll.remove(&id);
                }
            }
            if !touched.contains(&collection) {
                touched.push(collection);
            }
        }
        self.publish(&map, &touched);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
    ) -> CoreResult<(Vec<Doc>, broadcast::Receiver<CollectionSnapshot>)> {
        let map = self.lock_collections()?;
        let initial = Self::docs_of(&map, collection);

        let mut watchers = self
            .watchers
            .lock()
            .map_err(|e| CoreError::Internal(format!("store lock: {e}")))?;
        let tx = watchers
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        Ok((initial, tx.subscribe()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_delete_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("products", "p1", json!({ "name": "Beans", "stock_count": 10 }))
            .await
            .unwrap();

        let doc = store.get("products", "p1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "Beans");

        store.delete("products", "p1").await.unwrap();
        assert!(store.get("products", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_requires_existing_doc() {
        let store = MemoryStore::new();
        store
            .set("products", "p1", json!({ "name": "Beans", "stock_count": 10 }))
            .await
            .unwrap();

        store
            .update("products", "p1", json!({ "stock_count": 12 }))
            .await
            .unwrap();
        let doc = store.get("products", "p1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "Beans");
        assert_eq!(doc["stock_count"], 12);

        let err = store
            .update("products", "missing", json!({ "stock_count": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[tokio::test]
    async fn test_subscribe_returns_initial_docs_then_snapshots_in_order() {
        let store = MemoryStore::new();
        store.set("products", "p1", json!({ "n": 1 })).await.unwrap();

        let (initial, mut rx) = store.subscribe("products").await.unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].id, "p1");

        store.set("products", "p2", json!({ "n": 2 })).await.unwrap();
        store.set("products", "p3", json!({ "n": 3 })).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.docs.len(), 2);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.docs.len(), 3);
    }

    #[tokio::test]
    async fn test_transaction_reads_see_buffered_writes() {
        let store = MemoryStore::new();
        store
            .set("products", "p1", json!({ "stock_count": 10 }))
            .await
            .unwrap();

        store
            .run_transaction(Box::new(|tx| {
                let doc = tx.get("products", "p1")?.unwrap();
                assert_eq!(doc["stock_count"], 10);

                tx.set("products", "p1", json!({ "stock_count": 7 }));
                let doc = tx.get("products", "p1")?.unwrap();
                assert_eq!(doc["stock_count"], 7);

                tx.delete("products", "p1");
                assert!(tx.get("products", "p1")?.is_none());
                Ok(())
            }))
            .await
            .unwrap();

        assert!(store.get("products", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_transaction_commits_nothing_and_publishes_nothing() {
        let store = MemoryStore::new();
        store
            .set("products", "p1", json!({ "stock_count": 10 }))
            .await
            .unwrap();
        let (_, mut rx) = store.subscribe("products").await.unwrap();

        let err = store
            .run_transaction(Box::new(|tx| {
                tx.set("products", "p1", json!({ "stock_count": 0 }));
                tx.set("sales", "s1", json!({ "total": 5.0 }));
                Err(CoreError::Validation("cart is empty".into()))
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let doc = store.get("products", "p1").await.unwrap().unwrap();
        assert_eq!(doc["stock_count"], 10);
        assert!(store.get("sales", "s1").await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transaction_publishes_one_snapshot_per_touched_collection() {
        let store = MemoryStore::new();
        let (_, mut products_rx) = store.subscribe("products").await.unwrap();
        let (_, mut sales_rx) = store.subscribe("sales").await.unwrap();

        store
            .run_transaction(Box::new(|tx| {
                tx.set("products", "p1", json!({ "stock_count": 9 }));
                tx.set("products", "p2", json!({ "stock_count": 3 }));
                tx.set("sales", "s1", json!({ "total": 12.5 }));
                Ok(())
            }))
            .await
            .unwrap();

        let products = products_rx.recv().await.unwrap();
        assert_eq!(products.docs.len(), 2);
        // Both product writes arrive as one snapshot, not two.
        assert!(products_rx.try_recv().is_err());

        let sales = sales_rx.recv().await.unwrap();
        assert_eq!(sales.docs.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_transactions_serialise() {
        let store = Arc::new(MemoryStore::new());
        store.set("counters", "c", json!({ "n": 0 })).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store
                        .run_transaction(Box::new(|tx| {
                            let doc = tx.get("counters", "c")?.unwrap();
                            let n = doc["n"].as_i64().unwrap();
                            tx.set("counters", "c", json!({ "n": n + 1 }));
                            Ok(())
                        }))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = store.get("counters", "c").await.unwrap().unwrap();
        assert_eq!(doc["n"], 100);
    }
}
