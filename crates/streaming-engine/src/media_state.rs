//! Per-content-type `MediaState`: bookkeeping plus the update-loop state
//! machine of spec.md §4.1 ("State machine per MediaState").

use std::sync::Arc;

use crate::model::{ContentType, SegmentPosition, SegmentReference, Stream};

/// `IDLE -> FETCHING_INIT -> FETCHING_MEDIA -> APPENDING -> IDLE`, with the
/// `RECOVERING`/`EVICTING`/`FAILED`/`TERMINATED` branches spec.md §4.1 draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatePhase {
    Idle,
    FetchingInit,
    FetchingMedia,
    Appending,
    Evicting,
    Recovering,
    Failed,
    Terminated,
}

/// One active content type's fetch/append bookkeeping, named verbatim from
/// spec.md §3's `MediaState` record.
pub struct MediaState {
    pub content_type: ContentType,
    pub stream: Arc<Stream>,
    pub need_init_segment: bool,
    pub last_stream: Option<Arc<Stream>>,
    pub last_segment_reference: Option<SegmentReference>,
    pub end_of_stream: bool,
    pub performing_update: bool,
    pub waiting_to_clear_buffer: bool,
    pub clearing_buffer: bool,
    pub recovering: bool,
    pub has_error: bool,
    /// Time to resume fetching at once the cause of a pause (live-window
    /// unavailability, a surfaced gap) is cleared.
    pub resume_at: Option<f64>,
    pub phase: MediaStatePhase,
    /// Number of QUOTA_EXCEEDED retries observed without forward progress,
    /// reset to 0 on any successful append. Spec.md §7: repeated without
    /// progress across every type escalates to fatal.
    pub quota_retry_count: u32,
    pub current_period_id: String,
}

impl MediaState {
    pub fn new(content_type: ContentType, stream: Arc<Stream>, period_id: String) -> Self {
        Self {
            content_type,
            stream,
            need_init_segment: true,
            last_stream: None,
            last_segment_reference: None,
            end_of_stream: false,
            performing_update: false,
            waiting_to_clear_buffer: false,
            clearing_buffer: false,
            recovering: false,
            has_error: false,
            resume_at: None,
            phase: MediaStatePhase::Idle,
            quota_retry_count: 0,
            current_period_id: period_id,
        }
    }

    /// Replace the active stream (switch, or a new period's matching
    /// stream), keeping bookkeeping invariants: a new stream always needs
    /// its init segment fetched before the next media segment.
    pub fn set_stream(&mut self, stream: Arc<Stream>, period_id: String, needs_init: bool) {
        self.last_stream = Some(std::mem::replace(&mut self.stream, stream));
        self.current_period_id = period_id;
        self.need_init_segment = needs_init;
        self.last_segment_reference = None;
    }

    pub fn record_append(&mut self, reference: SegmentReference) {
        self.last_segment_reference = Some(reference);
        self.quota_retry_count = 0;
        self.has_error = false;
        self.phase = MediaStatePhase::Idle;
    }

    pub fn next_position(&self, target: f64) -> Option<SegmentPosition> {
        self.stream.segment_index.find(target)
    }

    pub fn is_at_last_segment(&self) -> bool {
        match &self.last_segment_reference {
            Some(reference) => self.stream.segment_index.is_last(reference.position),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment_index::VecSegmentIndex;

    fn make_stream(id: &str) -> Arc<Stream> {
        Arc::new(Stream {
            id: id.to_string(),
            period_id: "p0".to_string(),
            content_type: ContentType::Audio,
            mime_type: "audio/mp4".to_string(),
            init_segment: None,
            segment_index: Arc::new(VecSegmentIndex::new(None, Vec::new())),
            contains_emsg_boxes: false,
            trick_mode_video: None,
        })
    }

    #[test]
    fn new_media_state_needs_init_segment() {
        let state = MediaState::new(ContentType::Audio, make_stream("s0"), "p0".to_string());
        assert!(state.need_init_segment);
        assert_eq!(state.phase, MediaStatePhase::Idle);
    }

    #[test]
    fn set_stream_resets_init_need_and_last_reference() {
        let mut state = MediaState::new(ContentType::Audio, make_stream("s0"), "p0".to_string());
        state.record_append(SegmentReference {
            position: SegmentPosition(0),
            start_time: 0.0,
            end_time: 4.0,
            uris: vec!["a".to_string()],
            byte_range_start: None,
            byte_range_end: None,
        });
        assert!(state.last_segment_reference.is_some());

        state.set_stream(make_stream("s1"), "p1".to_string(), true);
        assert!(state.need_init_segment);
        assert!(state.last_segment_reference.is_none());
        assert_eq!(state.last_stream.unwrap().id, "s0");
        assert_eq!(state.current_period_id, "p1");
    }

    #[test]
    fn record_append_clears_error_and_quota_state() {
        let mut state = MediaState::new(ContentType::Video, make_stream("s0"), "p0".to_string());
        state.has_error = true;
        state.quota_retry_count = 2;
        state.record_append(SegmentReference {
            position: SegmentPosition(1),
            start_time: 4.0,
            end_time: 8.0,
            uris: vec!["b".to_string()],
            byte_range_start: None,
            byte_range_end: None,
        });
        assert!(!state.has_error);
        assert_eq!(state.quota_retry_count, 0);
        assert_eq!(state.phase, MediaStatePhase::Idle);
    }
}
