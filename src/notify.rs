//! Transient operator notices.
//!
//! Background work (queue flushes, connectivity flips) needs a way to
//! reach the UI outside of a request/response pair. The bus assigns each
//! posted notice an id and broadcasts `Posted`/`Dismissed` events; hosts
//! subscribe and render them as toasts. Posting with no subscribers is
//! fine and intentionally ignored.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Opaque handle to a posted notice, used to dismiss it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NoticeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One transient notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub id: NoticeId,
    pub level: NoticeLevel,
    pub message: String,
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NoticeEvent {
    Posted(Notice),
    Dismissed { id: NoticeId },
}

/// Broadcast fan-out for notices.
#[derive(Clone)]
pub struct NoticeBus {
    next_id: Arc<AtomicU64>,
    tx: broadcast::Sender<NoticeEvent>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            tx,
        }
    }

    /// Post a notice. Lossy when a subscriber lags; notices are advisory,
    /// not state.
    pub fn post(&self, level: NoticeLevel, message: impl Into<String>) -> NoticeId {
        let id = NoticeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let notice = Notice {
            id,
            level,
            message: message.into(),
        };
        debug!(id = id.0, level = ?level, message = %notice.message, "Posting notice");
        let _ = self.tx.send(NoticeEvent::Posted(notice));
        id
    }

    /// Dismiss a previously posted notice.
    pub fn dismiss(&self, id: NoticeId) {
        let _ = self.tx.send(NoticeEvent::Dismissed { id });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEvent> {
        self.tx.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
