//! Transfer engine - segmented parallel downloads
//!
//! This module implements the byte-level part of segdl:
//! - Segment planning over a declared size
//! - A worker pool per transfer fed from a sentinel-terminated work queue
//! - Positional writes of out-of-order chunks into a partial file
//! - Range verification and per-segment retry against the transport

mod coordinator;
mod memory;
mod planner;
mod segmented;
mod source;
mod worker;

pub use coordinator::*;
pub use memory::*;
pub use planner::*;
pub use segmented::*;
pub use source::*;
pub use worker::*;

pub(crate) use source::filename_from_url;
