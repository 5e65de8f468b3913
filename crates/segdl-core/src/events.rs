//! Event bus - fans transfer lifecycle events out to listeners and subscribers
//!
//! Publishing never blocks and never runs listener code. Notifications go
//! through an unbounded channel to a dispatcher task which invokes the
//! manager-level listeners and then forwards a [`CoreEvent`] to broadcast
//! subscribers, so listeners may freely call back into the queue manager.

use crate::transfer::Transfer;
use parking_lot::RwLock;
use segdl_types::CoreEvent;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of the broadcast channel handed to subscribers
const BROADCAST_CAPACITY: usize = 1000;

/// Infallible observer of every transfer handled by a queue manager
pub type ManagerListener = Arc<dyn Fn(&Transfer) + Send + Sync>;

/// Lifecycle point a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
}

enum Notification {
    Event {
        kind: EventKind,
        transfer: Transfer,
        event: CoreEvent,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct ManagerListeners {
    start: Vec<ManagerListener>,
    progress: Vec<ManagerListener>,
    completion: Vec<ManagerListener>,
    failure: Vec<ManagerListener>,
}

impl ManagerListeners {
    fn for_kind(&self, kind: EventKind) -> Vec<ManagerListener> {
        match kind {
            EventKind::Queued => Vec::new(),
            EventKind::Started => self.start.clone(),
            EventKind::Progress => self.progress.clone(),
            EventKind::Completed => self.completion.clone(),
            EventKind::Failed => self.failure.clone(),
        }
    }
}

/// Ordered, off-lock notification queue
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Notification>,
    events: broadcast::Sender<CoreEvent>,
    listeners: Arc<RwLock<ManagerListeners>>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher on the current runtime
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let listeners = Arc::new(RwLock::new(ManagerListeners::default()));

        tokio::spawn(dispatch(rx, listeners.clone(), events.clone()));

        Self {
            tx,
            events,
            listeners,
        }
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn on_start<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.listeners.write().start.push(Arc::new(listener));
    }

    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.listeners.write().progress.push(Arc::new(listener));
    }

    pub fn on_completion<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.listeners.write().completion.push(Arc::new(listener));
    }

    pub fn on_failure<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.listeners.write().failure.push(Arc::new(listener));
    }

    /// Queue a notification about `transfer`; the event payload is captured now
    pub fn publish(&self, kind: EventKind, transfer: &Transfer) {
        let event = match kind {
            EventKind::Queued => CoreEvent::TransferQueued {
                transfer: transfer.snapshot(),
            },
            EventKind::Started => CoreEvent::TransferStarted {
                transfer: transfer.snapshot(),
            },
            EventKind::Progress => CoreEvent::TransferProgress {
                id: transfer.id(),
                transferred: transfer.bytes_transferred(),
                total: transfer.total_size(),
            },
            EventKind::Completed => CoreEvent::TransferCompleted {
                transfer: transfer.snapshot(),
            },
            EventKind::Failed => CoreEvent::TransferFailed {
                transfer: transfer.snapshot(),
                error: transfer.error().unwrap_or_default(),
            },
        };

        let notification = Notification::Event {
            kind,
            transfer: transfer.clone(),
            event,
        };
        if self.tx.send(notification).is_err() {
            debug!("Event dispatcher gone, dropping {:?} for {}", kind, transfer.id());
        }
    }

    /// Resolve once every notification published before this call was dispatched
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Notification::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    listeners: Arc<RwLock<ManagerListeners>>,
    events: broadcast::Sender<CoreEvent>,
) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::Event {
                kind,
                transfer,
                event,
            } => {
                let targets = listeners.read().for_kind(kind);
                for listener in targets {
                    if catch_unwind(AssertUnwindSafe(|| listener(&transfer))).is_err() {
                        warn!("{:?} listener panicked for transfer {}", kind, transfer.id());
                    }
                }
                // No subscribers is fine
                let _ = events.send(event);
            }
            Notification::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use segdl_types::RemoteResource;

    fn transfer() -> Transfer {
        Transfer::new(RemoteResource::new("7", "a.bin", "mem://a.bin", 10), "/tmp")
    }

    #[tokio::test]
    async fn test_listeners_receive_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        bus.on_start(move |_| log.lock().push("start"));
        let log = seen.clone();
        bus.on_progress(move |_| log.lock().push("progress"));
        let log = seen.clone();
        bus.on_completion(move |_| log.lock().push("completion"));
        let log = seen.clone();
        bus.on_failure(move |_| log.lock().push("failure"));

        let t = transfer();
        bus.publish(EventKind::Queued, &t);
        bus.publish(EventKind::Started, &t);
        bus.publish(EventKind::Progress, &t);
        bus.publish(EventKind::Completed, &t);
        bus.flush().await;

        assert_eq!(*seen.lock(), vec!["start", "progress", "completion"]);
    }

    #[tokio::test]
    async fn test_subscribers_get_core_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let t = transfer();

        bus.publish(EventKind::Queued, &t);
        t.mark_failed("boom");
        bus.publish(EventKind::Failed, &t);

        assert!(matches!(rx.recv().await.unwrap(), CoreEvent::TransferQueued { .. }));
        match rx.recv().await.unwrap() {
            CoreEvent::TransferFailed { transfer, error } => {
                assert_eq!(transfer.id, t.id());
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        bus.on_start(|_| panic!("listener bug"));
        let counter = calls.clone();
        bus.on_start(move |_| *counter.lock() += 1);

        let t = transfer();
        bus.publish(EventKind::Started, &t);
        bus.publish(EventKind::Started, &t);
        bus.flush().await;

        assert_eq!(*calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_progress_payload_is_captured_at_publish() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let t = transfer();

        t.add_transferred(4);
        bus.publish(EventKind::Progress, &t);
        t.add_transferred(6);

        match rx.recv().await.unwrap() {
            CoreEvent::TransferProgress { transferred, total, .. } => {
                assert_eq!(transferred, 4);
                assert_eq!(total, 10);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
