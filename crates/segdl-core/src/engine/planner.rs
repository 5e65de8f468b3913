//! Segment planner - splits a transfer into byte ranges

use segdl_types::Segment;

/// Segments for one transfer and the number of workers to run them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub segments: Vec<Segment>,
    pub workers: usize,
}

impl SegmentPlan {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Build the segment plan for a transfer of `total_size` bytes.
///
/// Every segment is `segment_size` long except the last, which is marked
/// final and is requested open-ended.
pub fn plan_segments(total_size: u64, configured_workers: usize, segment_size: u64) -> SegmentPlan {
    let segment_size = segment_size.max(1);
    let mut segments = Vec::new();

    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < total_size {
        let remaining = total_size - offset;
        let is_final = remaining <= segment_size;
        let length = if is_final { remaining } else { segment_size };
        segments.push(Segment::new(index, offset, length, is_final));
        offset += length;
        index += 1;
    }

    let workers = effective_workers(total_size, configured_workers, segment_size);
    SegmentPlan { segments, workers }
}

/// Never start more workers than there are segments
pub fn effective_workers(total_size: u64, configured_workers: usize, segment_size: u64) -> usize {
    let segment_count = total_size.div_ceil(segment_size.max(1));
    let segment_count = usize::try_from(segment_count).unwrap_or(usize::MAX);
    configured_workers.max(1).min(segment_count)
}
