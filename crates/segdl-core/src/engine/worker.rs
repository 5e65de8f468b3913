//! Transfer worker - streams segments from the source into the completion channel
//!
//! Workers share one pre-loaded work queue. Each pulls a segment, issues a
//! ranged read, and forwards the body in fixed-size chunks tagged with their
//! absolute offset. A stop sentinel (or the shared error flag) ends the worker.

use crate::engine::source::RangeSource;
use crate::error::SegdlError;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use segdl_types::{Segment, TransferOptions};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Message sent from a worker to the coordinator's writer
#[derive(Debug)]
pub enum WorkerMessage {
    /// Bytes to write at `offset`
    Chunk { offset: u64, bytes: Bytes },
    /// The worker hit an error it could not recover from
    Failed { worker: usize, error: SegdlError },
    /// The worker has exited its loop
    Done { worker: usize },
}

/// Entry in the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    Segment(Segment),
    Stop,
}

/// Work queue pre-loaded with every segment followed by one stop per worker
#[derive(Debug)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkQueue {
    pub fn new(segments: &[Segment], workers: usize, cancelled: Arc<AtomicBool>) -> Self {
        let mut items: VecDeque<WorkItem> = segments.iter().copied().map(WorkItem::Segment).collect();
        items.extend(std::iter::repeat(WorkItem::Stop).take(workers));
        Self {
            items: Mutex::new(items),
            cancelled,
        }
    }

    /// Take the next item. Once the error flag is set every caller gets `Stop`.
    pub fn next(&self) -> WorkItem {
        if self.cancelled.load(Ordering::Acquire) {
            return WorkItem::Stop;
        }
        self.items.lock().pop_front().unwrap_or(WorkItem::Stop)
    }

    /// Items not yet handed out
    pub fn remaining(&self) -> usize {
        self.items.lock().len()
    }
}

/// A worker that streams segments for one transfer
pub struct TransferWorker {
    id: usize,
    locator: Arc<str>,
    source: Arc<dyn RangeSource>,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<WorkerMessage>,
    cancelled: Arc<AtomicBool>,
    options: Arc<TransferOptions>,
}

impl TransferWorker {
    pub fn new(
        id: usize,
        locator: Arc<str>,
        source: Arc<dyn RangeSource>,
        queue: Arc<WorkQueue>,
        tx: mpsc::Sender<WorkerMessage>,
        cancelled: Arc<AtomicBool>,
        options: Arc<TransferOptions>,
    ) -> Self {
        Self {
            id,
            locator,
            source,
            queue,
            tx,
            cancelled,
            options,
        }
    }

    /// Run until a stop sentinel, the error flag, or a failure
    pub async fn run(self) {
        debug!("Worker {} on {} started", self.id, self.locator);

        while let WorkItem::Segment(segment) = self.queue.next() {
            if let Err(error) = self.process_segment(&segment).await {
                warn!(
                    "Worker {} failed on segment {} (offset {}): {}",
                    self.id, segment.index, segment.offset, error
                );
                self.cancelled.store(true, Ordering::Release);
                let _ = self
                    .tx
                    .send(WorkerMessage::Failed {
                        worker: self.id,
                        error,
                    })
                    .await;
                break;
            }
        }

        debug!("Worker {} on {} finished", self.id, self.locator);
        let _ = self.tx.send(WorkerMessage::Done { worker: self.id }).await;
    }

    /// Download one segment, retrying from the last delivered byte
    async fn process_segment(&self, segment: &Segment) -> Result<(), SegdlError> {
        info!(
            "Worker {} starting segment {} (offset {}, {} bytes{})",
            self.id,
            segment.index,
            segment.offset,
            segment.length,
            if segment.is_final { ", final" } else { "" }
        );

        let mut cursor = segment.offset;
        let mut attempt = 0u32;

        loop {
            match self.stream_segment(segment, &mut cursor).await {
                Ok(()) => break,
                Err(e)
                    if e.is_retryable()
                        && attempt < self.options.max_segment_retries
                        && !self.cancelled.load(Ordering::Acquire) =>
                {
                    attempt += 1;
                    warn!(
                        "Segment {} failed at offset {} (attempt {}/{}): {}. Will retry.",
                        segment.index, cursor, attempt, self.options.max_segment_retries, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.options.retry_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "Segment {} complete ({} bytes)",
            segment.index,
            cursor - segment.offset
        );
        Ok(())
    }

    /// Stream the remainder of `segment` starting at `cursor`, advancing it per chunk
    async fn stream_segment(&self, segment: &Segment, cursor: &mut u64) -> Result<(), SegdlError> {
        let range = segment.range_from(*cursor);
        let mut stream = self
            .source
            .fetch(&self.locator, range, &self.options.extra_params)
            .await?;

        while let Some(item) = stream.next().await {
            let mut bytes = item?;

            if !segment.is_final {
                let remaining = segment.end() - *cursor;
                if bytes.len() as u64 > remaining {
                    return Err(SegdlError::RangeMismatch {
                        expected: segment.length,
                        received: (*cursor - segment.offset) + bytes.len() as u64,
                    });
                }
            }

            while !bytes.is_empty() {
                let take = bytes.len().min(self.options.read_chunk_size.max(1));
                let chunk = bytes.split_to(take);
                let len = chunk.len() as u64;
                self.tx
                    .send(WorkerMessage::Chunk {
                        offset: *cursor,
                        bytes: chunk,
                    })
                    .await
                    .map_err(|_| SegdlError::Cancelled)?;
                *cursor += len;
            }
        }

        if !segment.is_final && *cursor < segment.end() {
            return Err(SegdlError::SegmentTransport {
                offset: *cursor,
                message: format!(
                    "stream ended {} bytes short of segment {}",
                    segment.end() - *cursor,
                    segment.index
                ),
            });
        }

        Ok(())
    }
}
