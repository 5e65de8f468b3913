//! segdl Core - Segmented Transfer Engine
//!
//! This crate downloads remote resources in parallel byte-range segments and
//! runs queued transfers one at a time through a background manager.

mod config;
pub mod engine;
mod error;
mod events;
mod queue;
mod sync;
mod transfer;

pub use config::*;
pub use engine::{
    plan_segments, run_segmented_transfer, ChunkSink, FileSink, HttpRangeSource, MemorySource,
    RangeSource, SegmentPlan, SegmentedTransfer,
};
pub use error::*;
pub use events::*;
pub use queue::*;
pub use sync::*;
pub use transfer::*;

use segdl_types::{CoreEvent, EngineConfig, RemoteResource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// The main segdl core instance
#[derive(Clone)]
pub struct SegdlCore {
    config: Arc<EngineConfig>,
    source: Arc<dyn RangeSource>,
    queue: QueueManager,
}

impl SegdlCore {
    /// Create a core that downloads over HTTP and start its queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, SegdlError> {
        let source = Arc::new(HttpRangeSource::new(&config)?);
        Self::with_source(config, source)
    }

    /// Create a core on top of an arbitrary [`RangeSource`] and start its queue
    pub fn with_source(config: EngineConfig, source: Arc<dyn RangeSource>) -> Result<Self, SegdlError> {
        validate_config(&config)?;

        let runner = Arc::new(SegmentedTransfer::new(source.clone(), &config));
        let queue = QueueManager::new(
            runner,
            EventBus::new(),
            Duration::from_millis(config.idle_poll_ms),
        );
        queue.start();

        info!(
            "segdl core ready ({} workers, {} byte segments)",
            config.worker_count, config.segment_size
        );

        Ok(Self {
            config: Arc::new(config),
            source,
            queue,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.queue.subscribe()
    }

    // ========================================================================
    // Transfer Operations
    // ========================================================================

    /// Queue a download of `url`.
    ///
    /// When `size` is `None` the source is probed for it. Files land in
    /// `destination`, or the configured default directory.
    pub async fn add_transfer(
        &self,
        url: &str,
        size: Option<u64>,
        destination: Option<PathBuf>,
    ) -> Result<Transfer, SegdlError> {
        let parsed = url::Url::parse(url).map_err(|_| SegdlError::InvalidUrl(url.to_string()))?;

        let resource = match size {
            Some(size) => RemoteResource::new(url, engine::filename_from_url(&parsed), url, size),
            None => self.source.probe(url, &self.config.extra_params).await?,
        };

        let destination = destination.unwrap_or_else(|| self.config.default_destination.clone());
        let transfer = Transfer::new(resource, destination);
        self.queue.enqueue(transfer.clone());

        Ok(transfer)
    }

    /// Queue an already built transfer
    pub fn enqueue(&self, transfer: Transfer) {
        self.queue.enqueue(transfer);
    }

    pub fn list_active(&self) -> Vec<Transfer> {
        self.queue.list_active()
    }

    pub fn list_failed(&self) -> Vec<Transfer> {
        self.queue.list_failed()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Resolve once every queued transfer has finished
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Build a sync pass that feeds this core's queue
    pub fn sync_pass(
        &self,
        catalog: Arc<dyn RemoteCatalog>,
        history: Arc<dyn TransferHistory>,
        destination: Option<PathBuf>,
    ) -> SyncPass {
        let destination = destination.unwrap_or_else(|| self.config.default_destination.clone());
        SyncPass::new(catalog, history, self.queue.clone(), destination)
    }

    /// Stop the background queue after the current transfer
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segdl_types::TransferState;

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            worker_count: 3,
            segment_size: 256,
            read_chunk_size: 64,
            idle_poll_ms: 10,
            default_destination: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_add_transfer_probes_size() {
        let dir = tempfile::tempdir().unwrap();
        let data = MemorySource::pattern(1500);
        let core = SegdlCore::with_source(config(dir.path()), Arc::new(MemorySource::new(data.clone()))).unwrap();

        let transfer = core
            .add_transfer("mem://host/files/report.pdf", None, None)
            .await
            .unwrap();
        assert_eq!(transfer.total_size(), 1500);
        assert_eq!(transfer.file_name(), "report.pdf");

        core.wait_idle().await;
        assert_eq!(transfer.state(), TransferState::Completed);
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), data);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_transfer_with_known_size() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("elsewhere");
        let data = MemorySource::pattern(700);
        let core = SegdlCore::with_source(config(dir.path()), Arc::new(MemorySource::new(data.clone()))).unwrap();

        let transfer = core
            .add_transfer("mem://host/a/b.iso", Some(700), Some(other.clone()))
            .await
            .unwrap();
        core.wait_idle().await;

        assert_eq!(transfer.state(), TransferState::Completed);
        assert_eq!(std::fs::read(other.join("b.iso")).unwrap(), data);
        assert!(core.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let core = SegdlCore::with_source(config(dir.path()), Arc::new(MemorySource::new(Vec::new()))).unwrap();
        let err = core.add_transfer("not a url", Some(1), None).await.unwrap_err();
        assert!(matches!(err, SegdlError::InvalidUrl(_)));
        assert!(core.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            worker_count: 0,
            ..EngineConfig::default()
        };
        let result = SegdlCore::with_source(config, Arc::new(MemorySource::new(Vec::new())));
        assert!(matches!(result, Err(SegdlError::InvalidConfig(_))));
    }
}
