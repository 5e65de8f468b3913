//! Segmented transfer - runs a worker pool for one resource and drains its output
//!
//! Workers pull segments from a shared queue and push chunk messages into a
//! bounded completion channel. The caller's [`ChunkSink`] receives every chunk
//! exactly once at its absolute offset; arrival order is unspecified.

use crate::engine::planner::plan_segments;
use crate::engine::source::RangeSource;
use crate::engine::worker::{TransferWorker, WorkQueue, WorkerMessage};
use crate::error::SegdlError;
use segdl_types::TransferOptions;
use std::future::Future;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Capacity of the completion channel between workers and the writer
const CHANNEL_CAPACITY: usize = 256;

/// Consumer of chunk messages
pub trait ChunkSink: Send {
    /// Store `bytes` at `offset`. An error aborts the transfer.
    fn write_chunk(
        &mut self,
        offset: u64,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SegdlError>> + Send;
}

impl<F> ChunkSink for F
where
    F: FnMut(u64, &[u8]) -> Result<(), SegdlError> + Send,
{
    fn write_chunk(
        &mut self,
        offset: u64,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SegdlError>> + Send {
        std::future::ready((self)(offset, bytes))
    }
}

/// Positional writer over an open file
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Flush and fsync, returning the file
    pub async fn finish(mut self) -> Result<File, SegdlError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.file)
    }
}

impl ChunkSink for FileSink {
    fn write_chunk(
        &mut self,
        offset: u64,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SegdlError>> + Send {
        async move {
            let write = async {
                self.file.seek(SeekFrom::Start(offset)).await?;
                self.file.write_all(bytes).await?;
                self.file.flush().await
            };
            write
                .await
                .map_err(|source| SegdlError::Write { offset, source })
        }
    }
}

/// Download `total_size` bytes of `locator` in parallel segments, handing every
/// chunk to `sink`.
///
/// Returns the first error raised by a worker or by the sink. On failure no
/// further segments are handed out; workers finish their in-flight segment and
/// are joined before this returns.
pub async fn run_segmented_transfer<S: ChunkSink>(
    source: Arc<dyn RangeSource>,
    locator: &str,
    total_size: u64,
    sink: &mut S,
    options: &TransferOptions,
) -> Result<(), SegdlError> {
    let plan = plan_segments(total_size, options.worker_count, options.segment_size);
    if plan.is_empty() {
        debug!("Nothing to transfer for {}", locator);
        return Ok(());
    }

    info!(
        "Transferring {} ({} bytes) in {} segments with {} workers",
        locator,
        total_size,
        plan.segments.len(),
        plan.workers
    );

    let cancelled = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(WorkQueue::new(&plan.segments, plan.workers, cancelled.clone()));
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let locator: Arc<str> = Arc::from(locator);
    let options = Arc::new(options.clone());

    let mut workers = JoinSet::new();
    for id in 0..plan.workers {
        let worker = TransferWorker::new(
            id,
            locator.clone(),
            source.clone(),
            queue.clone(),
            tx.clone(),
            cancelled.clone(),
            options.clone(),
        );
        workers.spawn(worker.run());
    }
    // The channel closes once every worker has dropped its sender
    drop(tx);

    let mut first_error: Option<SegdlError> = None;
    let mut finished = 0usize;

    while finished < plan.workers {
        let Some(message) = rx.recv().await else {
            break;
        };

        match message {
            WorkerMessage::Chunk { offset, bytes } => {
                if first_error.is_some() {
                    continue;
                }
                if let Err(e) = sink.write_chunk(offset, &bytes).await {
                    error!("Writing chunk at offset {} failed: {}", offset, e);
                    cancelled.store(true, Ordering::Release);
                    first_error = Some(e);
                }
            }
            WorkerMessage::Failed { worker, error } => {
                warn!("Worker {} reported failure: {}", worker, error);
                cancelled.store(true, Ordering::Release);
                first_error.get_or_insert(error);
            }
            WorkerMessage::Done { worker } => {
                finished += 1;
                debug!("Worker {} done ({}/{})", worker, finished, plan.workers);
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Worker task panicked: {}", e);
            cancelled.store(true, Ordering::Release);
            first_error.get_or_insert(SegdlError::WorkerPanicked(e.to_string()));
        }
    }

    if finished < plan.workers && first_error.is_none() {
        first_error = Some(SegdlError::Fatal(format!(
            "{} of {} workers exited without signaling completion",
            plan.workers - finished,
            plan.workers
        )));
    }

    match first_error {
        Some(e) => {
            warn!("Transfer of {} failed: {}", locator, e);
            Err(e)
        }
        None => {
            info!("Transfer of {} complete", locator);
            Ok(())
        }
    }
}
