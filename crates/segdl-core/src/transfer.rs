//! Transfer descriptor - one queued download and its listeners

use crate::error::SegdlError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use segdl_types::{RemoteResource, TransferSnapshot, TransferState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Callback registered on a transfer. Returning an error aborts the transfer.
pub type TransferListener = Arc<dyn Fn(&Transfer) -> anyhow::Result<()> + Send + Sync>;

/// Shared handle to a transfer.
///
/// Cloning is cheap; all clones observe the same progress and state.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

struct TransferInner {
    id: Uuid,
    resource: RemoteResource,
    destination: PathBuf,
    transferred: AtomicU64,
    status: Mutex<TransferStatus>,
    listeners: Mutex<Listeners>,
}

struct TransferStatus {
    state: TransferState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

#[derive(Default)]
struct Listeners {
    start: Vec<TransferListener>,
    progress: Vec<TransferListener>,
    completion: Vec<TransferListener>,
    /// Queue-side progress hook; replaced, not appended, on every enqueue
    progress_observer: Option<TransferListener>,
}

#[derive(Clone, Copy)]
enum ListenerKind {
    Start,
    Progress,
    Completion,
}

impl Transfer {
    /// Create a queued transfer of `resource` into `destination` (a directory)
    pub fn new(resource: RemoteResource, destination: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(TransferInner {
                id: Uuid::new_v4(),
                resource,
                destination: destination.into(),
                transferred: AtomicU64::new(0),
                status: Mutex::new(TransferStatus {
                    state: TransferState::Queued,
                    started_at: None,
                    finished_at: None,
                    error: None,
                }),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn resource(&self) -> &RemoteResource {
        &self.inner.resource
    }

    /// Destination directory
    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    /// File name derived from the resource name, without path components
    pub fn file_name(&self) -> String {
        let name = self
            .inner
            .resource
            .name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        if name.is_empty() || name == "." || name == ".." {
            "download".to_string()
        } else {
            name.to_string()
        }
    }

    /// Final path of the downloaded file
    pub fn destination_path(&self) -> PathBuf {
        self.inner.destination.join(self.file_name())
    }

    pub fn total_size(&self) -> u64 {
        self.inner.resource.size
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TransferState {
        self.inner.status.lock().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.status.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.status.lock().finished_at
    }

    pub fn error(&self) -> Option<String> {
        self.inner.status.lock().error.clone()
    }

    /// Point-in-time copy of the public state
    pub fn snapshot(&self) -> TransferSnapshot {
        let status = self.inner.status.lock();
        TransferSnapshot {
            id: self.inner.id,
            resource: self.inner.resource.clone(),
            destination: self.destination_path(),
            bytes_transferred: self.bytes_transferred(),
            total_size: self.total_size(),
            state: status.state,
            started_at: status.started_at,
            finished_at: status.finished_at,
            error: status.error.clone(),
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a callback fired when the transfer starts
    pub fn on_start<F>(&self, listener: F)
    where
        F: Fn(&Transfer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.lock().start.push(Arc::new(listener));
    }

    /// Register a callback fired after every chunk is written
    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(&Transfer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.lock().progress.push(Arc::new(listener));
    }

    /// Register a callback fired once the file is in its final place
    pub fn on_completion<F>(&self, listener: F)
    where
        F: Fn(&Transfer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.lock().completion.push(Arc::new(listener));
    }

    /// Install the single progress hook owned by the queue the transfer is in
    pub(crate) fn set_progress_observer<F>(&self, observer: F)
    where
        F: Fn(&Transfer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.lock().progress_observer = Some(Arc::new(observer));
    }

    pub(crate) fn notify_start(&self) -> Result<(), SegdlError> {
        self.fire(ListenerKind::Start)
    }

    pub(crate) fn notify_progress(&self) -> Result<(), SegdlError> {
        self.fire(ListenerKind::Progress)
    }

    pub(crate) fn notify_completion(&self) -> Result<(), SegdlError> {
        self.fire(ListenerKind::Completion)
    }

    /// Invoke listeners outside the registration lock; the first error wins
    fn fire(&self, kind: ListenerKind) -> Result<(), SegdlError> {
        let listeners: Vec<TransferListener> = {
            let listeners = self.inner.listeners.lock();
            match kind {
                ListenerKind::Start => listeners.start.clone(),
                ListenerKind::Progress => listeners
                    .progress
                    .iter()
                    .chain(listeners.progress_observer.iter())
                    .cloned()
                    .collect(),
                ListenerKind::Completion => listeners.completion.clone(),
            }
        };

        for listener in listeners {
            listener(self).map_err(SegdlError::listener)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a run from scratch; a re-enqueued transfer counts bytes anew
    pub(crate) fn mark_active(&self) {
        let mut status = self.inner.status.lock();
        self.inner.transferred.store(0, Ordering::Release);
        status.state = TransferState::Active;
        status.started_at = Some(Utc::now());
        status.finished_at = None;
        status.error = None;
    }

    /// Count `bytes` as written, returning the new total
    pub(crate) fn add_transferred(&self, bytes: u64) -> u64 {
        self.inner.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub(crate) fn mark_completed(&self) {
        let mut status = self.inner.status.lock();
        status.state = TransferState::Completed;
        status.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&self, error: impl Into<String>) {
        let mut status = self.inner.status.lock();
        status.state = TransferState::Failed;
        status.finished_at = Some(Utc::now());
        status.error = Some(error.into());
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("resource", &self.inner.resource.id)
            .field("state", &self.state())
            .field("transferred", &self.bytes_transferred())
            .field("total", &self.total_size())
            .finish()
    }
}
