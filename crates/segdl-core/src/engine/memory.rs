//! In-memory range source
//!
//! Serves byte ranges out of a buffer. Used for offline runs and tests; it
//! can be told to fail, cut reads short, send past the requested end, or
//! ignore ranges like a server without range support.

use crate::engine::source::{check_range_response, ChunkStream, RangeSource};
use crate::error::SegdlError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use segdl_types::{ByteRange, RemoteResource};
use std::time::Duration;

/// A [`RangeSource`] backed by a byte buffer
pub struct MemorySource {
    data: Bytes,
    chunk_size: usize,
    delay: Option<Duration>,
    fail_at: Option<u64>,
    ignore_ranges: bool,
    overdeliver: u64,
    truncate: Mutex<Option<(u32, u64)>>,
    requests: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            chunk_size: 1000,
            delay: None,
            fail_at: None,
            ignore_ranges: false,
            overdeliver: 0,
            truncate: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Deterministic test payload of `len` bytes
    pub fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Size of the body pieces yielded by each stream
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleep before each body piece
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Any read covering `offset` errors once it reaches that byte
    pub fn fail_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Answer every read with the whole body, as a server without range support does
    pub fn ignore_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    /// Bounded reads run `extra` bytes past their requested end, capped at the data length
    pub fn overdeliver(mut self, extra: u64) -> Self {
        self.overdeliver = extra;
        self
    }

    /// The first `reads` fetches end cleanly at absolute offset `at`
    pub fn truncate_first_reads(self, reads: u32, at: u64) -> Self {
        *self.truncate.lock() = Some((reads, at));
        self
    }

    /// `Range` header values seen so far, in request order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn open(&self, range: ByteRange) -> Result<ChunkStream, SegdlError> {
        self.requests.lock().push(range.header_value());

        if self.ignore_ranges {
            check_range_response(StatusCode::OK, None, range)?;
        }

        let len = self.len();
        let start = range.start.min(len);
        let mut end = range
            .end
            .map(|e| (e + 1 + self.overdeliver).min(len))
            .unwrap_or(len);

        {
            let mut truncate = self.truncate.lock();
            if let Some((reads, at)) = truncate.as_mut() {
                if *reads > 0 {
                    *reads -= 1;
                    end = end.min((*at).max(start));
                }
            }
        }

        let mut items: Vec<Result<Bytes, SegdlError>> = Vec::new();
        let stop = match self.fail_at {
            Some(fail) if fail >= start && fail < end => fail,
            _ => end,
        };
        let mut pos = start;
        while pos < stop {
            let next = (pos + self.chunk_size as u64).min(stop);
            items.push(Ok(self.data.slice(pos as usize..next as usize)));
            pos = next;
        }
        if stop < end {
            items.push(Err(SegdlError::SegmentTransport {
                offset: stop,
                message: "connection reset".to_string(),
            }));
        }

        let stream = futures::stream::iter(items);
        Ok(match self.delay {
            Some(delay) => stream
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => stream.boxed(),
        })
    }
}

impl RangeSource for MemorySource {
    fn fetch<'a>(
        &'a self,
        _locator: &'a str,
        range: ByteRange,
        _extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<ChunkStream, SegdlError>> {
        futures::future::ready(self.open(range)).boxed()
    }

    fn probe<'a>(
        &'a self,
        locator: &'a str,
        _extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<RemoteResource, SegdlError>> {
        let name = locator
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string();
        let resource = RemoteResource::new(locator, name, locator, self.len());
        futures::future::ready(Ok(resource)).boxed()
    }
}
