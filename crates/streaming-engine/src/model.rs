//! Presentation/Period/Stream data model, verbatim in meaning from the
//! distilled specification's data model section.

use std::sync::Arc;

use crate::segment_index::SegmentIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Audio,
    Video,
    Text,
    /// A first-class variant rather than a flag on `Video`, so
    /// `setTrickPlay` can swap just this MediaState without disturbing the
    /// primary video one.
    TrickVideo,
}

/// Opaque position within a stream's segment index; monotonic within one
/// stream but not meaningful across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentPosition(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentReference {
    pub position: SegmentPosition,
    pub start_time: f64,
    pub end_time: f64,
    pub uris: Vec<String>,
    pub byte_range_start: Option<u64>,
    pub byte_range_end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitSegmentReference {
    pub uris: Vec<String>,
    pub byte_range_start: Option<u64>,
    pub byte_range_end: Option<u64>,
}

/// One content type's representation within one `Period`.
#[derive(Clone)]
pub struct Stream {
    pub id: String,
    /// The `Period` this stream belongs to, set by whoever builds the
    /// presentation (out of core scope). Lets the orchestrator detect a
    /// chooser returning a stream from the wrong period without needing a
    /// back-reference to `Period` itself.
    pub period_id: String,
    pub content_type: ContentType,
    pub mime_type: String,
    pub init_segment: Option<InitSegmentReference>,
    pub segment_index: Arc<dyn SegmentIndex>,
    pub contains_emsg_boxes: bool,
    /// The trick-mode counterpart this stream switches to under
    /// `setTrickPlay(true)`, if one exists (only meaningful for `Video`).
    pub trick_mode_video: Option<Arc<Stream>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("period_id", &self.period_id)
            .field("content_type", &self.content_type)
            .field("mime_type", &self.mime_type)
            .field("contains_emsg_boxes", &self.contains_emsg_boxes)
            .finish()
    }
}

/// An audio+video pairing within a `Period`.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: String,
    pub audio: Option<Arc<Stream>>,
    pub video: Option<Arc<Stream>>,
    pub bandwidth: u64,
}

/// One contiguous, non-overlapping span of the presentation.
#[derive(Debug, Clone)]
pub struct Period {
    pub id: String,
    pub start_time: f64,
    /// `None` for the last period of a live presentation.
    pub duration: Option<f64>,
    pub variants: Vec<Variant>,
    pub text_streams: Vec<Arc<Stream>>,
}

impl Period {
    pub fn end_time(&self) -> Option<f64> {
        self.duration.map(|d| self.start_time + d)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && self.end_time().map_or(true, |end| time < end)
    }
}

/// Mutable `[availabilityStart, availabilityEnd]` window plus overall
/// duration and live/VOD mode.
#[derive(Debug, Clone, Copy)]
pub struct PresentationTimeline {
    pub availability_start: f64,
    pub availability_end: f64,
    pub duration: Option<f64>,
    pub is_live: bool,
}

impl PresentationTimeline {
    pub fn vod(duration: f64) -> Self {
        Self {
            availability_start: 0.0,
            availability_end: duration,
            duration: Some(duration),
            is_live: false,
        }
    }

    pub fn live(availability_start: f64, availability_end: f64) -> Self {
        Self {
            availability_start,
            availability_end,
            duration: None,
            is_live: true,
        }
    }

    /// Slide the window forward for a live presentation; a no-op for VOD.
    pub fn slide(&mut self, new_start: f64, new_end: f64) {
        if !self.is_live {
            return;
        }
        self.availability_start = new_start;
        self.availability_end = new_end;
    }

    /// Clamp `target` into `[availability_start + epsilon, availability_end
    /// - epsilon]`.
    pub fn clamp_to_availability(&self, target: f64, epsilon: f64) -> f64 {
        let low = self.availability_start + epsilon;
        let high = (self.availability_end - epsilon).max(low);
        target.clamp(low, high)
    }
}
