//! Segmented transfer coordinator - runs one queued transfer to a final file
//!
//! Chunks are written into `<name>.<partial_suffix>` next to the destination.
//! Only a fully drained, error-free run renames the partial file into place;
//! on failure the partial file is left behind untouched.

use crate::engine::segmented::{run_segmented_transfer, ChunkSink, FileSink};
use crate::engine::source::RangeSource;
use crate::error::SegdlError;
use crate::queue::TransferRunner;
use crate::transfer::Transfer;
use futures::future::BoxFuture;
use futures::FutureExt;
use segdl_types::{EngineConfig, TransferOptions};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tracing::{error, info};

/// Runs transfers against a [`RangeSource`]
#[derive(Clone)]
pub struct SegmentedTransfer {
    source: Arc<dyn RangeSource>,
    options: TransferOptions,
    partial_suffix: String,
}

impl SegmentedTransfer {
    pub fn new(source: Arc<dyn RangeSource>, config: &EngineConfig) -> Self {
        Self::with_options(source, config.transfer_options(), config.partial_suffix.clone())
    }

    pub fn with_options(
        source: Arc<dyn RangeSource>,
        options: TransferOptions,
        partial_suffix: impl Into<String>,
    ) -> Self {
        Self {
            source,
            options,
            partial_suffix: partial_suffix.into(),
        }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Working file the chunks of `transfer` are written to
    pub fn partial_path(&self, transfer: &Transfer) -> PathBuf {
        transfer
            .destination()
            .join(format!("{}.{}", transfer.file_name(), self.partial_suffix))
    }

    /// Run `transfer` to a terminal state.
    ///
    /// On success the file is at [`Transfer::destination_path`] and the
    /// transfer is `Completed`; otherwise it is `Failed` and the error is
    /// returned.
    pub async fn run(&self, transfer: &Transfer) -> Result<(), SegdlError> {
        info!(
            "Starting transfer {} of {} ({} bytes)",
            transfer.id(),
            transfer.resource().url,
            transfer.total_size()
        );

        let result = self.execute(transfer).await;
        match &result {
            Ok(()) => info!(
                "Transfer {} complete: {:?}",
                transfer.id(),
                transfer.destination_path()
            ),
            Err(e) => {
                error!("Transfer {} failed: {}", transfer.id(), e);
                transfer.mark_failed(e.to_string());
            }
        }
        result
    }

    async fn execute(&self, transfer: &Transfer) -> Result<(), SegdlError> {
        transfer.notify_start()?;

        fs::create_dir_all(transfer.destination()).await?;
        let final_path = transfer.destination_path();
        let total_size = transfer.total_size();

        if total_size == 0 {
            fs::File::create(&final_path).await?;
        } else {
            let partial_path = self.partial_path(transfer);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&partial_path)
                .await?;

            let mut sink = TransferSink {
                file: FileSink::new(file),
                transfer,
            };
            run_segmented_transfer(
                self.source.clone(),
                &transfer.resource().url,
                total_size,
                &mut sink,
                &self.options,
            )
            .await?;

            // Close before the rename so the handle never outlives the partial name
            drop(sink.file.finish().await?);
            fs::rename(&partial_path, &final_path).await?;
        }

        transfer.mark_completed();
        transfer.notify_completion()
    }
}

impl TransferRunner for SegmentedTransfer {
    fn run(&self, transfer: Transfer) -> BoxFuture<'static, Result<(), SegdlError>> {
        let this = self.clone();
        async move { SegmentedTransfer::run(&this, &transfer).await }.boxed()
    }
}

/// Writes chunks to the partial file and reports them on the transfer
struct TransferSink<'a> {
    file: FileSink,
    transfer: &'a Transfer,
}

impl ChunkSink for TransferSink<'_> {
    fn write_chunk(
        &mut self,
        offset: u64,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SegdlError>> + Send {
        async move {
            self.file.write_chunk(offset, bytes).await?;
            self.transfer.add_transferred(bytes.len() as u64);
            self.transfer.notify_progress()
        }
    }
}
