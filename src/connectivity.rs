//! Connectivity monitor.
//!
//! One background task decides whether the register counts as online. It
//! combines a host-provided online hint (browser/navigator style; false
//! short-circuits without touching the network) with the backend health
//! probe, publishes the result on a watch channel, and nudges the
//! dispatcher with a flush signal when connectivity comes back. State
//! transitions are logged and posted once, not every cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::api::CallableBackend;
use crate::dispatcher::FlushReason;
use crate::notify::{NoticeBus, NoticeLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Online,
    Offline,
}

impl ConnState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnState::Online)
    }
}

/// Spawn the monitor task. The first check runs immediately so the rest
/// of the engine is not stuck assuming offline for a whole interval
/// after startup.
pub fn spawn(
    backend: Arc<dyn CallableBackend>,
    online_hint: Arc<AtomicBool>,
    interval: Duration,
    flush_tx: mpsc::Sender<FlushReason>,
    notices: NoticeBus,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> watch::Receiver<ConnState> {
    let (state_tx, state_rx) = watch::channel(ConnState::Offline);

    tracker.spawn(async move {
        info!("Connectivity monitor started (interval: {:?})", interval);
        let mut previous: Option<bool> = None;

        loop {
            let hinted = online_hint.load(Ordering::SeqCst);
            let online = if hinted {
                backend.is_reachable().await
            } else {
                false
            };

            if online {
                if previous == Some(false) {
                    info!("Connectivity restored; requesting queue flush");
                    notices.post(NoticeLevel::Info, "Back online.");
                    let _ = flush_tx.try_send(FlushReason::BackOnline);
                }
                previous = Some(true);
                publish(&state_tx, ConnState::Online);
            } else {
                if previous != Some(false) {
                    if hinted {
                        info!("Backend unreachable; keeping queue pending");
                    } else {
                        info!("Host reports offline; skipping heartbeat");
                    }
                    notices.post(NoticeLevel::Warning, "Connection lost. Working offline.");
                }
                previous = Some(false);
                publish(&state_tx, ConnState::Offline);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Connectivity monitor stopped");
    });

    state_rx
}

/// Publish only on change so watchers awaiting `changed()` are not woken
/// every cycle.
fn publish(tx: &watch::Sender<ConnState>, state: ConnState) {
    tx.send_if_modified(|current| {
        if *current != state {
            *current = state;
            true
        } else {
            false
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use crate::notify::NoticeEvent;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        reachable: AtomicBool,
        probes: AtomicUsize,
    }

    impl FakeBackend {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(reachable),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CallableBackend for FakeBackend {
        async fn invoke(&self, _name: &str, _payload: &Value) -> CoreResult<Value> {
            Ok(Value::Null)
        }

        async fn is_reachable(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }
    }

    fn harness(
        backend: Arc<FakeBackend>,
        hint: bool,
    ) -> (
        watch::Receiver<ConnState>,
        mpsc::Receiver<FlushReason>,
        Arc<AtomicBool>,
        CancellationToken,
        TaskTracker,
    ) {
        let hint = Arc::new(AtomicBool::new(hint));
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let state = spawn(
            backend,
            Arc::clone(&hint),
            Duration::from_millis(10),
            flush_tx,
            NoticeBus::default(),
            &tracker,
            cancel.clone(),
        );
        (state, flush_rx, hint, cancel, tracker)
    }

    #[tokio::test]
    async fn test_hint_false_short_circuits_without_probing() {
        let backend = FakeBackend::new(true);
        let (state, _flush_rx, _hint, cancel, tracker) = harness(Arc::clone(&backend), false);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*state.borrow(), ConnState::Offline);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 0);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_reachable_backend_goes_online() {
        let backend = FakeBackend::new(true);
        let (mut state, _flush_rx, _hint, cancel, tracker) = harness(backend, true);

        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnState::Online);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_restored_connectivity_requests_flush() {
        let backend = FakeBackend::new(false);
        let (mut state, mut flush_rx, _hint, cancel, tracker) = harness(Arc::clone(&backend), true);

        // Let at least one offline evaluation happen, then restore.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*state.borrow(), ConnState::Offline);
        backend.reachable.store(true, Ordering::SeqCst);

        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnState::Online);
        assert_eq!(flush_rx.recv().await, Some(FlushReason::BackOnline));

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_transitions_post_one_notice_each() {
        let backend = FakeBackend::new(false);
        let hint = Arc::new(AtomicBool::new(true));
        let (flush_tx, _flush_rx) = mpsc::channel(8);
        let notices = NoticeBus::default();
        let mut notice_rx = notices.subscribe();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let mut state = spawn(
            Arc::clone(&backend) as Arc<dyn CallableBackend>,
            hint,
            Duration::from_millis(10),
            flush_tx,
            notices,
            &tracker,
            cancel.clone(),
        );

        // Offline notice fires once even though several cycles run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        match notice_rx.recv().await.unwrap() {
            NoticeEvent::Posted(notice) => {
                assert_eq!(notice.level, NoticeLevel::Warning);
                assert!(notice.message.contains("offline"));
            }
            other => panic!("expected Posted, got {other:?}"),
        }
        assert!(notice_rx.try_recv().is_err());

        backend.reachable.store(true, Ordering::SeqCst);
        state.changed().await.unwrap();
        match notice_rx.recv().await.unwrap() {
            NoticeEvent::Posted(notice) => {
                assert_eq!(notice.level, NoticeLevel::Info);
                assert_eq!(notice.message, "Back online.");
            }
            other => panic!("expected Posted, got {other:?}"),
        }

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
