//! Shared types for segdl
//!
//! This crate contains the data structures shared between the
//! transfer engine and the command-line driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Default number of parallel workers per transfer
pub const DEFAULT_WORKER_COUNT: usize = 4;
/// Default segment size (200 MiB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 200 * 1024 * 1024;
/// Default size of a single read from a segment stream (64 KiB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
/// Suffix appended to the destination name while a transfer is in flight
pub const DEFAULT_PARTIAL_SUFFIX: &str = "part";

// ============================================================================
// Transfer Types
// ============================================================================

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl TransferState {
    /// Completed and Failed are terminal; the queue drops the entry afterwards
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

/// A remote resource as reported by a catalog or a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Stable identity of the resource on the remote side
    pub id: String,
    /// File name to use locally
    pub name: String,
    /// Locator for ranged reads
    pub url: String,
    /// Declared total size in bytes
    pub size: u64,
}

impl RemoteResource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            size,
        }
    }
}

/// Byte interval requested from the server.
///
/// `end` is inclusive; `None` means open-ended (`bytes=<start>-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn bounded(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Value for the HTTP `Range` header
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes covered, if bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// One contiguous byte range of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    /// The final segment is requested open-ended to tolerate size mismatches
    pub is_final: bool,
}

impl Segment {
    pub fn new(index: u32, offset: u64, length: u64, is_final: bool) -> Self {
        Self {
            index,
            offset,
            length,
            is_final,
        }
    }

    /// Exclusive end of the planned range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Range to request when resuming at `cursor` inside this segment
    pub fn range_from(&self, cursor: u64) -> ByteRange {
        if self.is_final {
            ByteRange::open(cursor)
        } else {
            ByteRange::bounded(cursor, self.end() - 1)
        }
    }

    /// Range covering the whole segment
    pub fn range(&self) -> ByteRange {
        self.range_from(self.offset)
    }
}

/// Point-in-time copy of a transfer's public state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: Uuid,
    pub resource: RemoteResource,
    pub destination: PathBuf,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub state: TransferState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub fn progress(&self) -> f64 {
        if self.total_size > 0 {
            (self.bytes_transferred as f64 / self.total_size as f64) * 100.0
        } else if self.state == TransferState::Completed {
            100.0
        } else {
            0.0
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Engine configuration, passed explicitly into constructors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on parallel workers per transfer
    pub worker_count: usize,
    /// Bytes per segment (the last segment may be shorter)
    pub segment_size: u64,
    /// Maximum bytes per chunk message
    pub read_chunk_size: usize,
    /// Retries per segment before the transfer fails
    pub max_segment_retries: u32,
    /// Delay between segment retries in milliseconds
    pub retry_delay_ms: u64,
    /// Idle wait of the queue loop in milliseconds
    pub idle_poll_ms: u64,
    pub connect_timeout_secs: u64,
    /// Socket read timeout; a stalled segment fails after this long
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Working extension of the temp file, without the dot
    pub partial_suffix: String,
    pub default_destination: PathBuf,
    /// Query parameters appended to every ranged read
    pub extra_params: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            segment_size: DEFAULT_SEGMENT_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_segment_retries: 3,
            retry_delay_ms: 1000,
            idle_poll_ms: 500,
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            user_agent: format!("segdl/{}", env!("CARGO_PKG_VERSION")),
            partial_suffix: DEFAULT_PARTIAL_SUFFIX.to_string(),
            default_destination: dirs::download_dir()
                .map(|p| p.join("segdl"))
                .unwrap_or_else(|| PathBuf::from(".")),
            extra_params: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Per-transfer options derived from this configuration
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            worker_count: self.worker_count,
            segment_size: self.segment_size,
            read_chunk_size: self.read_chunk_size,
            max_segment_retries: self.max_segment_retries,
            retry_delay_ms: self.retry_delay_ms,
            extra_params: self.extra_params.clone(),
        }
    }
}

/// Options for a single segmented transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptions {
    pub worker_count: usize,
    pub segment_size: u64,
    pub read_chunk_size: usize,
    pub max_segment_retries: u32,
    pub retry_delay_ms: u64,
    pub extra_params: Vec<(String, String)>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        EngineConfig::default().transfer_options()
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TransferQueued {
        transfer: TransferSnapshot,
    },
    TransferStarted {
        transfer: TransferSnapshot,
    },
    TransferProgress {
        id: Uuid,
        transferred: u64,
        total: u64,
    },
    TransferCompleted {
        transfer: TransferSnapshot,
    },
    TransferFailed {
        transfer: TransferSnapshot,
        error: String,
    },
}
