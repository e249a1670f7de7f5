//! `SegmentIndex`: maps a presentation time to a segment position and a
//! position to its byte range + URI, lazily and without assuming any
//! particular manifest representation backs it.

use crate::model::{InitSegmentReference, SegmentPosition, SegmentReference};

pub trait SegmentIndex: Send + Sync {
    /// Find the position of the segment containing `time`, or `None` if
    /// `time` falls before the first segment or after the last.
    fn find(&self, time: f64) -> Option<SegmentPosition>;

    fn get(&self, position: SegmentPosition) -> Option<SegmentReference>;

    fn init_segment(&self) -> Option<InitSegmentReference>;

    fn last_position(&self) -> Option<SegmentPosition>;

    fn is_last(&self, position: SegmentPosition) -> bool {
        self.last_position() == Some(position)
    }

    /// The nearest segment whose `start_time` is strictly after `time`, used
    /// by the orchestrator's gap-jump logic when `find` comes up empty mid-
    /// period. Default implementation always reports no gap to jump;
    /// concrete indices should override it.
    fn next_after(&self, _time: f64) -> Option<SegmentReference> {
        None
    }
}

/// A plain sorted-vector segment index, sufficient for VOD manifests and
/// for tests; a live manifest's index would instead wrap a playlist parser
/// that can grow the available range over time.
pub struct VecSegmentIndex {
    init_segment: Option<InitSegmentReference>,
    segments: Vec<SegmentReference>,
}

impl VecSegmentIndex {
    /// `segments` must be sorted by `start_time` and non-overlapping.
    pub fn new(init_segment: Option<InitSegmentReference>, segments: Vec<SegmentReference>) -> Self {
        Self {
            init_segment,
            segments,
        }
    }
}

impl SegmentIndex for VecSegmentIndex {
    fn find(&self, time: f64) -> Option<SegmentPosition> {
        self.segments
            .binary_search_by(|seg| {
                if time < seg.start_time {
                    std::cmp::Ordering::Greater
                } else if time >= seg.end_time {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
            .map(|idx| self.segments[idx].position)
    }

    fn get(&self, position: SegmentPosition) -> Option<SegmentReference> {
        self.segments.iter().find(|s| s.position == position).cloned()
    }

    fn init_segment(&self) -> Option<InitSegmentReference> {
        self.init_segment.clone()
    }

    fn last_position(&self) -> Option<SegmentPosition> {
        self.segments.last().map(|s| s.position)
    }

    fn next_after(&self, time: f64) -> Option<SegmentReference> {
        self.segments
            .iter()
            .find(|s| s.start_time > time)
            .cloned()
    }
}
