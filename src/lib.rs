//! Brightcart POS - offline-first sale & inventory engine
//!
//! This crate is the headless core of the Brightcart point-of-sale app:
//! a durable offline request queue, a connectivity monitor, a queue
//! dispatcher, optimistic product/customer projections, and a
//! transactional sale recorder. The embedding UI constructs an
//! [`Engine`] per paired workspace and talks to it through watch
//! channels and explicit submit calls; authoritative data lives behind
//! the [`DocumentStore`] seam, remote callables behind
//! [`CallableBackend`].

mod api;
mod connectivity;
mod db;
mod dispatcher;
mod engine;
mod error;
mod logging;
mod models;
mod notify;
mod projection;
mod queue;
mod reconcile;
mod sale;
mod session;
mod store;

pub use api::{CallableBackend, HttpBackend};
pub use connectivity::ConnState;
pub use dispatcher::{FlushReason, SyncStatus};
pub use engine::{Engine, SubmitOutcome};
pub use error::{CoreError, CoreResult, ErrorClass};
pub use logging::init_logging;
pub use models::{
    CartLine, Customer, Payment, PaymentMethod, Product, Sale, SaleDraft, SaleItem, SaleTotals,
    StockLedgerEntry, StockMovement, StockReceipt,
};
pub use notify::{Notice, NoticeBus, NoticeEvent, NoticeId, NoticeLevel};
pub use queue::{QueueCounts, QueuedRequest, RequestKind, RequestStatus};
pub use reconcile::{DeltaMap, PendingDelta};
pub use session::{normalize_backend_url, EngineConfig, Pairing};
pub use store::{CollectionSnapshot, Doc, DocumentStore, MemoryStore, TransactionView, TxFn};
