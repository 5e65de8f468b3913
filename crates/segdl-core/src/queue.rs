//! Queue manager - runs queued transfers one at a time in the background
//!
//! The head of the queue stays in place while it runs and is removed only once
//! it reaches a terminal state, so `is_empty()` turning true means every
//! enqueued transfer has finished.

use crate::error::SegdlError;
use crate::events::{EventBus, EventKind};
use crate::transfer::Transfer;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use segdl_types::{CoreEvent, TransferState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Executes a single transfer for the queue manager
pub trait TransferRunner: Send + Sync {
    /// Drive `transfer` to completion or failure
    fn run(&self, transfer: Transfer) -> BoxFuture<'static, Result<(), SegdlError>>;
}

/// Serializes transfers through a single background loop
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    queue: Mutex<VecDeque<Transfer>>,
    failed: Mutex<Vec<Transfer>>,
    runner: Arc<dyn TransferRunner>,
    events: EventBus,
    /// Released by `enqueue` to end an idle wait early
    wake: Notify,
    /// Released whenever the queue becomes empty
    drained: Notify,
    shutdown: CancellationToken,
    idle_poll: Duration,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Create a stopped manager. `idle_poll` bounds how long the loop sleeps
    /// on an empty queue before checking again.
    pub fn new(runner: Arc<dyn TransferRunner>, events: EventBus, idle_poll: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                failed: Mutex::new(Vec::new()),
                runner,
                events,
                wake: Notify::new(),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                idle_poll,
                started: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Append `transfer` to the tail of the queue
    pub fn enqueue(&self, transfer: Transfer) {
        let events = self.inner.events.clone();
        transfer.set_progress_observer(move |t| {
            events.publish(EventKind::Progress, t);
            Ok(())
        });

        let position = {
            let mut queue = self.inner.queue.lock();
            queue.push_back(transfer.clone());
            queue.len()
        };
        info!(
            "Queued transfer {} ({}) at position {}",
            transfer.id(),
            transfer.resource().name,
            position
        );

        self.inner.events.publish(EventKind::Queued, &transfer);
        self.inner.wake.notify_one();
    }

    /// True iff no transfer is queued or running
    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Copy of the queue, head first. Later enqueues do not affect it.
    pub fn list_active(&self) -> Vec<Transfer> {
        self.inner.queue.lock().iter().cloned().collect()
    }

    /// Latest failed transfer per resource, oldest first
    pub fn list_failed(&self) -> Vec<Transfer> {
        self.inner.failed.lock().clone()
    }

    pub fn on_start<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner.events.on_start(listener);
    }

    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner.events.on_progress(listener);
    }

    pub fn on_completion<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner.events.on_completion(listener);
    }

    pub fn on_failure<F>(&self, listener: F)
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner.events.on_failure(listener);
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Spawn the background loop. Calling this more than once has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("Queue manager already running");
            return;
        }
        let inner = self.inner.clone();
        *self.inner.handle.lock() = Some(tokio::spawn(run_loop(inner)));
    }

    /// Resolve once the queue is empty
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Stop the loop after the current transfer finishes. Queued transfers stay queued.
    pub async fn shutdown(&self) {
        info!("Stopping queue manager");
        self.inner.shutdown.cancel();

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Queue loop ended abnormally: {}", e);
            }
        }
        self.inner.events.flush().await;
    }
}

async fn run_loop(inner: Arc<QueueInner>) {
    info!("Queue manager started");

    while !inner.shutdown.is_cancelled() {
        let head = inner.queue.lock().front().cloned();

        let Some(transfer) = head else {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.idle_poll) => {
                    trace!("Queue idle");
                }
            }
            continue;
        };

        inner.process(transfer).await;
    }

    info!("Queue manager stopped");
}

impl QueueInner {
    async fn process(&self, transfer: Transfer) {
        transfer.mark_active();
        self.events.publish(EventKind::Started, &transfer);

        // A panic inside the runner surfaces as a JoinError instead of killing the loop
        let outcome = match tokio::spawn(self.runner.run(transfer.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => {
                error!("Transfer {} crashed: {}", transfer.id(), e);
                Err(SegdlError::Fatal(format!("transfer task crashed: {}", e)).to_string())
            }
        };

        match outcome {
            Ok(()) if transfer.state() != TransferState::Failed => {
                if !transfer.state().is_terminal() {
                    transfer.mark_completed();
                }
            }
            Ok(()) => {}
            Err(message) => {
                if transfer.state() != TransferState::Failed {
                    transfer.mark_failed(message);
                }
            }
        }

        let now_empty = {
            let mut queue = self.queue.lock();
            match queue.front() {
                Some(head) if head.id() == transfer.id() => {
                    queue.pop_front();
                }
                _ => warn!("Queue head changed while transfer {} was running", transfer.id()),
            }
            queue.is_empty()
        };

        if transfer.state() == TransferState::Failed {
            warn!(
                "Transfer {} failed: {}",
                transfer.id(),
                transfer.error().unwrap_or_default()
            );
            {
                // Keep only the latest failure per resource
                let mut failed = self.failed.lock();
                failed.retain(|t| t.resource().id != transfer.resource().id);
                failed.push(transfer.clone());
            }
            self.events.publish(EventKind::Failed, &transfer);
        } else {
            info!("Transfer {} completed", transfer.id());
            self.events.publish(EventKind::Completed, &transfer);
        }

        if now_empty {
            debug!("Queue drained");
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use segdl_types::RemoteResource;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RunnerState {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    /// Records invocation order and overlap; names starting with `panic` or
    /// `fail` misbehave accordingly
    struct RecordingRunner {
        state: Arc<RunnerState>,
        delay: Duration,
    }

    impl RecordingRunner {
        fn new(delay_ms: u64) -> (Arc<Self>, Arc<RunnerState>) {
            let state = Arc::new(RunnerState::default());
            let runner = Arc::new(Self {
                state: state.clone(),
                delay: Duration::from_millis(delay_ms),
            });
            (runner, state)
        }
    }

    impl TransferRunner for RecordingRunner {
        fn run(&self, transfer: Transfer) -> BoxFuture<'static, Result<(), SegdlError>> {
            let state = self.state.clone();
            let delay = self.delay;
            async move {
                let name = transfer.resource().name.clone();
                state.order.lock().push(name.clone());
                let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_active.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(delay).await;
                state.active.fetch_sub(1, Ordering::SeqCst);

                if name.starts_with("panic") {
                    panic!("runner bug on {}", name);
                }
                if name.starts_with("fail") {
                    return Err(SegdlError::SegmentTransport {
                        offset: 0,
                        message: "connection reset".into(),
                    });
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn transfer(name: &str) -> Transfer {
        Transfer::new(RemoteResource::new(name, name, format!("mem://{}", name), 10), "/tmp")
    }

    fn manager(runner: Arc<RecordingRunner>, idle_poll_ms: u64) -> QueueManager {
        QueueManager::new(runner, EventBus::new(), Duration::from_millis(idle_poll_ms))
    }

    async fn wait_for_state(t: &Transfer, state: TransferState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while t.state() != state {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("transfer never reached state");
    }

    #[tokio::test]
    async fn test_fifo_and_mutual_exclusion() {
        let (runner, state) = RecordingRunner::new(30);
        let manager = manager(runner, 10);
        let (d1, d2, d3) = (transfer("d1"), transfer("d2"), transfer("d3"));
        manager.enqueue(d1.clone());
        manager.enqueue(d2.clone());
        manager.enqueue(d3.clone());
        manager.start();

        wait_for_state(&d3, TransferState::Active).await;
        assert!(!manager.is_empty());
        assert_eq!(d1.state(), TransferState::Completed);
        assert_eq!(d2.state(), TransferState::Completed);

        manager.wait_idle().await;
        assert!(d3.state().is_terminal());
        assert!(manager.is_empty());
        assert_eq!(*state.order.lock(), vec!["d1", "d2", "d3"]);
        assert_eq!(state.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_active_is_a_snapshot() {
        let (runner, _) = RecordingRunner::new(50);
        let manager = manager(runner, 10);
        let d1 = transfer("d1");
        manager.enqueue(d1.clone());
        manager.start();
        wait_for_state(&d1, TransferState::Active).await;

        let snapshot = manager.list_active();
        manager.enqueue(transfer("d2"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), d1.id());
        assert_eq!(manager.list_active().len(), 2);
        manager.wait_idle().await;
    }

    #[tokio::test]
    async fn test_panicking_runner_marks_failed_and_continues() {
        let (runner, state) = RecordingRunner::new(1);
        let manager = manager(runner, 10);
        let bad = transfer("panic-me");
        let good = transfer("good");
        manager.enqueue(bad.clone());
        manager.enqueue(good.clone());
        manager.start();
        manager.wait_idle().await;

        assert_eq!(bad.state(), TransferState::Failed);
        assert!(bad.error().unwrap().contains("crashed"));
        assert_eq!(good.state(), TransferState::Completed);
        assert_eq!(*state.order.lock(), vec!["panic-me", "good"]);

        let failed = manager.list_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id(), bad.id());
    }

    #[tokio::test]
    async fn test_failure_event_published() {
        let (runner, _) = RecordingRunner::new(1);
        let manager = manager(runner, 10);
        let mut rx = manager.subscribe();
        let t = transfer("fail-me");
        manager.enqueue(t.clone());
        manager.start();
        manager.wait_idle().await;
        manager.events().flush().await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                CoreEvent::TransferQueued { .. } => "queued",
                CoreEvent::TransferStarted { .. } => "started",
                CoreEvent::TransferProgress { .. } => "progress",
                CoreEvent::TransferCompleted { .. } => "completed",
                CoreEvent::TransferFailed { error, .. } => {
                    assert!(error.contains("connection reset"));
                    "failed"
                }
            });
        }
        assert_eq!(kinds, vec!["queued", "started", "failed"]);
        assert_eq!(t.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_listeners_may_reenter_manager() {
        let (runner, state) = RecordingRunner::new(1);
        let manager = manager(runner, 10);

        let reentrant = manager.clone();
        let followed_up = Arc::new(AtomicBool::new(false));
        let flag = followed_up.clone();
        manager.on_completion(move |t| {
            let _ = reentrant.list_active();
            let _ = reentrant.is_empty();
            if t.resource().name == "first" && !flag.swap(true, Ordering::SeqCst) {
                reentrant.enqueue(transfer("follow-up"));
            }
        });

        manager.enqueue(transfer("first"));
        manager.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.order.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        manager.wait_idle().await;
        assert_eq!(*state.order.lock(), vec!["first", "follow-up"]);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_idle_loop() {
        let (runner, _) = RecordingRunner::new(1);
        let manager = manager(runner, 60_000);
        manager.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let t = transfer("late");
        manager.enqueue(t.clone());
        tokio::time::timeout(Duration::from_secs(5), manager.wait_idle())
            .await
            .unwrap();
        assert_eq!(t.state(), TransferState::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (runner, state) = RecordingRunner::new(1);
        let manager = manager(runner, 10);
        manager.start();
        manager.shutdown().await;

        let t = transfer("after-shutdown");
        manager.enqueue(t.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.state(), TransferState::Queued);
        assert!(state.order.lock().is_empty());
        assert!(!manager.is_empty());
    }

    #[tokio::test]
    async fn test_failed_list_keeps_latest_per_resource() {
        let (runner, _) = RecordingRunner::new(1);
        let manager = manager(runner, 10);
        manager.start();

        let first = transfer("fail-me");
        manager.enqueue(first.clone());
        manager.wait_idle().await;
        let second = transfer("fail-me");
        manager.enqueue(second.clone());
        manager.wait_idle().await;

        let failed = manager.list_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id(), second.id());
        assert_eq!(first.state(), TransferState::Failed);
    }

    /// Reports `chunks` writes of `chunk` bytes each
    struct ChunkingRunner {
        chunks: u64,
        chunk: u64,
    }

    impl TransferRunner for ChunkingRunner {
        fn run(&self, transfer: Transfer) -> BoxFuture<'static, Result<(), SegdlError>> {
            let (chunks, chunk) = (self.chunks, self.chunk);
            async move {
                for _ in 0..chunks {
                    transfer.add_transferred(chunk);
                    transfer.notify_progress()?;
                }
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_requeued_transfer_starts_over() {
        let runner = Arc::new(ChunkingRunner { chunks: 10, chunk: 100 });
        let manager = QueueManager::new(runner, EventBus::new(), Duration::from_millis(10));
        let progress = Arc::new(AtomicUsize::new(0));
        let counter = progress.clone();
        manager.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.start();

        let t = transfer("again");
        manager.enqueue(t.clone());
        manager.wait_idle().await;
        assert_eq!(t.bytes_transferred(), 1000);

        manager.enqueue(t.clone());
        manager.wait_idle().await;
        manager.events().flush().await;

        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), 1000);
        assert_eq!(progress.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_queue() {
        let (runner, _) = RecordingRunner::new(1);
        let manager = manager(runner, 10);
        tokio_test::assert_ready!(tokio_test::task::spawn(manager.wait_idle()).poll());
    }
}
