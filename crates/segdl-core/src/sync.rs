//! Sync pass - mirrors a remote catalog into the download queue
//!
//! Each pass lists the catalog, skips resources already recorded in the
//! transfer history or already queued, and enqueues the rest. A finished
//! transfer is recorded in the history and, unless remote copies are kept,
//! deleted from the catalog.

use crate::error::SegdlError;
use crate::queue::QueueManager;
use crate::transfer::Transfer;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use segdl_types::RemoteResource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Remote listing and deletion
pub trait RemoteCatalog: Send + Sync {
    fn list(&self) -> BoxFuture<'_, Result<Vec<RemoteResource>, SegdlError>>;

    fn delete<'a>(&'a self, resource: &'a RemoteResource) -> BoxFuture<'a, Result<(), SegdlError>>;
}

/// A finished transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub resource_id: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub name: String,
}

/// Dedup store of finished transfers
pub trait TransferHistory: Send + Sync {
    fn exists(&self, resource_id: &str) -> bool;

    /// Store `record`. Recording an id twice keeps the first record.
    fn record(&self, record: HistoryRecord) -> Result<(), SegdlError>;
}

/// Process-local [`TransferHistory`]
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: RwLock<HashMap<String, HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }
}

impl TransferHistory for MemoryHistory {
    fn exists(&self, resource_id: &str) -> bool {
        self.records.read().contains_key(resource_id)
    }

    fn record(&self, record: HistoryRecord) -> Result<(), SegdlError> {
        self.records
            .write()
            .entry(record.resource_id.clone())
            .or_insert(record);
        Ok(())
    }
}

pub struct SyncPass {
    catalog: Arc<dyn RemoteCatalog>,
    history: Arc<dyn TransferHistory>,
    queue: QueueManager,
    destination: PathBuf,
    keep_remote: bool,
    /// Remote deletes started by completion listeners
    deletes: Arc<Mutex<JoinSet<()>>>,
}

impl SyncPass {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        history: Arc<dyn TransferHistory>,
        queue: QueueManager,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            history,
            queue,
            destination: destination.into(),
            keep_remote: false,
            deletes: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Leave remote resources in place after they are downloaded
    pub fn keep_remote(mut self, keep: bool) -> Self {
        self.keep_remote = keep;
        self
    }

    /// List the catalog once and enqueue everything not yet downloaded.
    ///
    /// Only a history record marks a resource as done; a leftover partial
    /// file does not. Returns the number of transfers enqueued.
    pub async fn run_once(&self) -> Result<usize, SegdlError> {
        self.reap_deletes();
        let resources = self.catalog.list().await?;
        let queued: Vec<String> = self
            .queue
            .list_active()
            .iter()
            .map(|t| t.resource().id.clone())
            .collect();

        let mut added = 0;
        for resource in resources {
            if self.history.exists(&resource.id) {
                debug!("Skipping {} ({}): already downloaded", resource.name, resource.id);
                continue;
            }
            if queued.contains(&resource.id) {
                debug!("Skipping {} ({}): already queued", resource.name, resource.id);
                continue;
            }

            let transfer = Transfer::new(resource, self.destination.clone());
            self.attach_completion(&transfer);
            self.queue.enqueue(transfer);
            added += 1;
        }

        if added > 0 {
            info!("Sync pass queued {} new transfers", added);
        }
        Ok(added)
    }

    /// Run passes every `interval` until `shutdown` fires
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!("Sync loop started (interval {:?})", interval);
        loop {
            if let Err(e) = self.run_once().await {
                warn!("Sync pass failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.wait_deletes().await;
        info!("Sync loop stopped");
    }

    /// Resolve once every remote delete started so far has finished
    pub async fn wait_deletes(&self) {
        let mut pending = std::mem::take(&mut *self.deletes.lock());
        if !pending.is_empty() {
            debug!("Waiting for {} remote deletes", pending.len());
        }
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!("Remote delete task ended abnormally: {}", e);
            }
        }
    }

    /// Drop handles of deletes that have already finished
    fn reap_deletes(&self) {
        let mut deletes = self.deletes.lock();
        while let Some(joined) = deletes.try_join_next() {
            if let Err(e) = joined {
                warn!("Remote delete task ended abnormally: {}", e);
            }
        }
    }

    fn attach_completion(&self, transfer: &Transfer) {
        let history = self.history.clone();
        let catalog = self.catalog.clone();
        let keep_remote = self.keep_remote;
        let deletes = self.deletes.clone();

        transfer.on_completion(move |t| {
            let resource = t.resource().clone();
            history.record(HistoryRecord {
                resource_id: resource.id.clone(),
                size: t.total_size(),
                timestamp: t.finished_at().unwrap_or_else(Utc::now),
                name: t.file_name(),
            })?;

            if !keep_remote {
                let catalog = catalog.clone();
                deletes.lock().spawn(async move {
                    match catalog.delete(&resource).await {
                        Ok(()) => info!("Deleted remote {} ({})", resource.name, resource.id),
                        Err(e) => warn!("Failed to delete remote {}: {}", resource.name, e),
                    }
                });
            }
            Ok(())
        });
    }
}
