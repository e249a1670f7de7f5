//! `StreamingEngine`: the orchestrator of spec.md §4.1 — startup, seek,
//! switch, trick play, destroy, and the per-content-type `MediaState`
//! update loop, built the way `mesio-engine::hls::coordinator` owns its
//! trait-object collaborators and `scheduler` runs one independent loop per
//! pipeline stage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use text_engine::{ParserRegistry, TextEngine, TextTrackSink};

use crate::config::StreamingConfig;
use crate::emsg::scan_emsg_boxes;
use crate::error::StreamingError;
use crate::media_state::{MediaState, MediaStatePhase};
use crate::model::{ContentType, Period, PresentationTimeline, SegmentReference, Stream};
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::traits::{EngineCallbacks, MediaSink, NetworkEngine, NetworkRequest, Playhead, RequestType};

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// What a single `step()` call decided to do, so `run()`'s scheduling loop
/// (or a test) knows what to do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Reschedule(Duration),
    Ended,
    /// Surfaced a gap the configured thresholds refuse to jump; this type
    /// stops advancing until `seeked()`.
    GapSurfaced,
    PeriodTransitioned,
}

struct Inner {
    periods: Vec<Period>,
    current_period_idx: usize,
    timeline: PresentationTimeline,
    config: StreamingConfig,
    media_states: HashMap<ContentType, MediaState>,
    trick_play_enabled: bool,
    startup_complete: bool,
    destroyed: bool,
    /// Set, while holding the lock, by whichever task's `step()` first
    /// observes every content type at its final segment. Guards the
    /// single call to `sink.end_of_stream()` (spec.md §4.1/§8) against the
    /// race where two content types' tasks both observe the unanimous
    /// condition before either has appended its terminal state.
    end_of_stream_signaled: bool,
}

/// Drives per-content-type fetch/append loops so each type's buffer stays
/// ahead of the playhead, coordinating period transitions, eviction, and
/// fault recovery across them. Holds its collaborators by value (never a
/// reference back to whoever constructed it), per spec.md §9's design note.
pub struct StreamingEngine {
    inner: Mutex<Inner>,
    network: Arc<dyn NetworkEngine>,
    sink: Arc<dyn MediaSink>,
    playhead: Arc<dyn Playhead>,
    callbacks: Arc<dyn EngineCallbacks>,
    text_engine: Arc<TextEngine>,
    token: CancellationToken,
}

impl StreamingEngine {
    pub fn new(
        periods: Vec<Period>,
        timeline: PresentationTimeline,
        config: StreamingConfig,
        network: Arc<dyn NetworkEngine>,
        sink: Arc<dyn MediaSink>,
        playhead: Arc<dyn Playhead>,
        callbacks: Arc<dyn EngineCallbacks>,
        text_track_sink: Arc<dyn TextTrackSink>,
    ) -> Self {
        let registry = Arc::new(ParserRegistry::new());
        text_engine::register_builtin_parsers(&registry);
        let text_engine = Arc::new(TextEngine::new(registry, text_track_sink));

        Self {
            inner: Mutex::new(Inner {
                periods,
                current_period_idx: 0,
                timeline,
                config,
                media_states: HashMap::new(),
                trick_play_enabled: false,
                startup_complete: false,
                destroyed: false,
                end_of_stream_signaled: false,
            }),
            network,
            sink,
            playhead,
            callbacks,
            text_engine,
            token: CancellationToken::new(),
        }
    }

    /// Buffered end for `content_type`, dispatched to whichever buffer
    /// actually holds it: the text cue store for `Text`, the media sink
    /// otherwise. Spec.md's `BE` is defined per type against "the sink",
    /// and the text pipeline's sink is `TextEngine` (spec.md §4.2), not the
    /// media sink `EngineCallbacks`/`MediaSink` abstracts over.
    async fn buffered_end_for(&self, content_type: ContentType) -> f64 {
        if content_type == ContentType::Text {
            self.text_engine.buffer_end().await.unwrap_or(0.0)
        } else {
            self.sink.buffered_end(content_type)
        }
    }

    async fn buffered_start_for(&self, content_type: ContentType) -> f64 {
        if content_type == ContentType::Text {
            self.text_engine.buffer_start().await.unwrap_or(0.0)
        } else {
            self.sink.buffered_start(content_type)
        }
    }

    async fn remove_buffer_range(&self, content_type: ContentType, start: f64, end: f64) -> Result<(), StreamingError> {
        if content_type == ContentType::Text {
            self.text_engine.remove(start, end).await;
            Ok(())
        } else {
            self.sink.remove(content_type, start, end).await
        }
    }

    fn period_index_for(periods: &[Period], time: f64) -> Option<usize> {
        periods
            .iter()
            .position(|p| p.contains(time))
            .or_else(|| periods.iter().rposition(|p| time >= p.start_time))
    }

    // ---- Startup protocol (spec.md §4.1 "Startup protocol") ----------

    pub async fn init(&self) -> Result<(), StreamingError> {
        let playhead_time = self.playhead.get_time();
        let period = {
            let inner = self.inner.lock().await;
            let idx = Self::period_index_for(&inner.periods, playhead_time).ok_or_else(|| {
                StreamingError::Internal {
                    reason: "no period contains the current playhead time".to_string(),
                }
            })?;
            inner.periods[idx].clone()
        };

        let mut chosen = self.callbacks.on_choose_streams(&period).await;

        // Step 2: discard and re-choose if the chooser answered for the
        // wrong period.
        let wrong_period = [&chosen.audio, &chosen.video, &chosen.text]
            .into_iter()
            .flatten()
            .any(|s| s.period_id != period.id);
        let mut target_period = period;
        if wrong_period {
            let correct_idx = {
                let inner = self.inner.lock().await;
                chosen
                    .audio
                    .as_ref()
                    .or(chosen.video.as_ref())
                    .or(chosen.text.as_ref())
                    .and_then(|s| inner.periods.iter().position(|p| p.id == s.period_id))
            };
            if let Some(idx) = correct_idx {
                target_period = { self.inner.lock().await.periods[idx].clone() };
                chosen = self.callbacks.on_choose_streams(&target_period).await;
            }
        }

        // Step 3: init the sink with chosen mime types and set duration.
        let mut mime_map = HashMap::new();
        if let Some(s) = &chosen.audio {
            mime_map.insert(ContentType::Audio, s.mime_type.clone());
        }
        if let Some(s) = &chosen.video {
            mime_map.insert(ContentType::Video, s.mime_type.clone());
        }
        if let Some(s) = &chosen.text {
            mime_map.insert(ContentType::Text, s.mime_type.clone());
        }
        self.sink.init(mime_map).await?;

        let duration = { self.inner.lock().await.timeline.duration };
        if let Some(d) = duration {
            self.sink.set_duration(d).await?;
        }

        // Step 4: build segment indices for chosen streams, failing on the
        // first error encountered (not partially initializing).
        for s in [&chosen.audio, &chosen.video, &chosen.text].into_iter().flatten() {
            self.callbacks.create_segment_index(s)?;
        }
        self.callbacks.on_initial_streams_setup();

        // `startAtSegmentBoundary`: ask the host to snap the playhead to the
        // start of the segment covering the initial position, preferring a
        // video stream over audio/text since it drives the append timeline.
        let config_snapshot = { self.inner.lock().await.config.clone() };
        if config_snapshot.start_at_segment_boundary {
            let boundary_stream = chosen.video.as_ref().or(chosen.audio.as_ref());
            if let Some(stream) = boundary_stream {
                if let Some(pos) = stream.segment_index.find(playhead_time) {
                    if let Some(seg) = stream.segment_index.get(pos) {
                        if (seg.start_time - playhead_time).abs() > f64::EPSILON {
                            self.callbacks.on_playhead_seek_suggested(seg.start_time);
                        }
                    }
                }
            }
        }

        if let Some(s) = &chosen.text {
            self.text_engine.init_parser(&s.mime_type).await?;
            self.text_engine.set_timestamp_offset(target_period.start_time).await;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.current_period_idx =
                Self::period_index_for(&inner.periods, target_period.start_time).unwrap_or(0);
            if let Some(s) = chosen.audio.clone() {
                inner
                    .media_states
                    .insert(ContentType::Audio, MediaState::new(ContentType::Audio, s, target_period.id.clone()));
            }
            if let Some(s) = chosen.video.clone() {
                inner
                    .media_states
                    .insert(ContentType::Video, MediaState::new(ContentType::Video, s, target_period.id.clone()));
            }
            if let Some(s) = chosen.text.clone() {
                inner
                    .media_states
                    .insert(ContentType::Text, MediaState::new(ContentType::Text, s, target_period.id.clone()));
            }
        }

        // Step 5 (done sequentially rather than in parallel tasks; the
        // cooperative scheduling model in SPEC_FULL.md §6 does not require
        // literal concurrency here, only that onCanSwitch follows indexing).
        for variant in &target_period.variants {
            if let Some(a) = &variant.audio {
                let _ = self.callbacks.create_segment_index(a);
            }
            if let Some(v) = &variant.video {
                let _ = self.callbacks.create_segment_index(v);
            }
        }
        for t in &target_period.text_streams {
            let _ = self.callbacks.create_segment_index(t);
        }
        self.callbacks.on_can_switch(&target_period);

        Ok(())
    }

    // ---- Per-type update loop (spec.md §4.1 "MediaState update loop") --

    /// Run one iteration of the nine-step update loop for `content_type`.
    pub async fn step(&self, content_type: ContentType) -> Result<StepOutcome, StreamingError> {
        if self.token.is_cancelled() {
            return Err(StreamingError::Cancelled);
        }

        let playhead_time = self.playhead.get_time();
        let buffered_end = self.buffered_end_for(content_type).await;

        let snapshot = {
            let inner = self.inner.lock().await;
            let Some(state) = inner.media_states.get(&content_type) else {
                return Ok(StepOutcome::Ended);
            };
            if state.end_of_stream {
                return Ok(StepOutcome::Ended);
            }
            (
                state.stream.clone(),
                state.need_init_segment,
                state.current_period_id.clone(),
                inner.config.clone(),
                inner.timeline,
            )
        };
        let (stream, need_init_segment, state_period_id, config, timeline) = snapshot;

        // Step 2: unanimous end-of-stream across every active type. The
        // flip of `end_of_stream_signaled` happens under the same lock
        // acquisition that checks the unanimous condition, so of every
        // task racing to observe it, exactly one wins and calls the sink;
        // the rest see it already set and just mark themselves ended.
        let won_end_of_stream = {
            let mut inner = self.inner.lock().await;
            if inner.end_of_stream_signaled {
                false
            } else if Self::all_types_at_final_segment_locked(&inner) {
                inner.end_of_stream_signaled = true;
                true
            } else {
                false
            }
        };
        if won_end_of_stream {
            self.sink.end_of_stream().await?;
            let mut inner = self.inner.lock().await;
            for state in inner.media_states.values_mut() {
                state.end_of_stream = true;
                state.phase = MediaStatePhase::Terminated;
            }
            info!("all content types exhausted; end of stream signaled");
            return Ok(StepOutcome::Ended);
        }
        if self.inner.lock().await.end_of_stream_signaled {
            return Ok(StepOutcome::Ended);
        }

        // Step 3: buffer-ahead throttle.
        let buffered_ahead = (buffered_end - playhead_time).max(0.0);
        if buffered_ahead >= config.buffer_goals.buffering_goal {
            return Ok(StepOutcome::Reschedule(secs(
                buffered_ahead - config.buffer_goals.buffering_goal + 0.1,
            )));
        }

        // Step 4: resolve target time's period; transition if it moved on.
        let target = if buffered_end > playhead_time { buffered_end } else { playhead_time };
        let period = {
            let inner = self.inner.lock().await;
            match Self::period_index_for(&inner.periods, target).map(|idx| inner.periods[idx].clone()) {
                Some(p) => p,
                None => return Ok(StepOutcome::Reschedule(Duration::from_millis(500))),
            }
        };

        if period.id != state_period_id {
            self.transition_period(&period).await?;
            return Ok(StepOutcome::PeriodTransitioned);
        }

        // Live availability window clamp.
        let fetch_target = if timeline.is_live {
            if target > timeline.availability_end {
                timeline.availability_start + config.live_edge_epsilon
            } else if target < timeline.availability_start {
                let wait = timeline.availability_start - target;
                return Ok(StepOutcome::Reschedule(secs(wait.max(0.1))));
            } else {
                timeline.clamp_to_availability(target, config.live_edge_epsilon)
            }
        } else {
            target
        };

        // Step 5: resolve segment position, with gap handling on a miss.
        let position = match stream.segment_index.find(fetch_target) {
            Some(p) => p,
            None => return self.handle_missing_segment(content_type, &stream, fetch_target, &config, timeline).await,
        };

        // Step 6: init segment first, if this stream hasn't had one yet.
        if need_init_segment {
            self.fetch_and_append_init(content_type, &stream, &config).await?;
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.media_states.get_mut(&content_type) {
                state.need_init_segment = false;
            }
        }

        let segment_ref = stream.segment_index.get(position).ok_or_else(|| StreamingError::SegmentNotFound {
            period_id: period.id.clone(),
            time: fetch_target,
        })?;

        // Step 7: fetch + append the media segment.
        match self
            .fetch_and_append_media(content_type, &stream, &segment_ref, &config, timeline.is_live)
            .await
        {
            Ok(()) => {
                let became_startup_complete = {
                    let mut inner = self.inner.lock().await;
                    if let Some(state) = inner.media_states.get_mut(&content_type) {
                        state.record_append(segment_ref.clone());
                    }
                    if !inner.startup_complete
                        && !inner.media_states.is_empty()
                        && inner.media_states.values().all(|s| s.last_segment_reference.is_some())
                    {
                        inner.startup_complete = true;
                        true
                    } else {
                        false
                    }
                };
                if became_startup_complete {
                    self.callbacks.on_startup_complete();
                }
                self.callbacks.on_segment_appended(content_type);
            }
            Err(StreamingError::QuotaExceeded { .. }) => {
                return self.handle_quota_exceeded(content_type, playhead_time, &config).await;
            }
            Err(err) => {
                self.mark_error(content_type).await;
                if config.ignore_text_stream_failures && content_type == ContentType::Text && err.category() == "TEXT" {
                    let mut inner = self.inner.lock().await;
                    if let Some(state) = inner.media_states.get_mut(&content_type) {
                        state.end_of_stream = true;
                    }
                    warn!(error = %err, "disabling text stream after ignored failure");
                    return Ok(StepOutcome::Ended);
                }
                self.callbacks.on_error(&err);
                return Err(err);
            }
        }

        // Step 8: evict buffer behind the playhead beyond `bufferBehind`.
        self.evict_if_needed(content_type, playhead_time, &config).await?;

        // Step 9: reschedule.
        Ok(StepOutcome::Reschedule(config.min_update_interval))
    }

    async fn handle_missing_segment(
        &self,
        content_type: ContentType,
        stream: &Arc<Stream>,
        target: f64,
        config: &StreamingConfig,
        timeline: PresentationTimeline,
    ) -> Result<StepOutcome, StreamingError> {
        if timeline.is_live {
            // Likely not yet available; wait a tick rather than declare a gap.
            return Ok(StepOutcome::Reschedule(Duration::from_millis(500)));
        }

        match stream.segment_index.next_after(target) {
            Some(next) => {
                let gap = next.start_time - target;
                if gap <= config.gap_jump.small_gap_limit || config.gap_jump.jump_large_gaps {
                    debug!(?content_type, gap, "jumping small/allowed gap to next segment");
                    Ok(StepOutcome::Reschedule(Duration::from_millis(10)))
                } else {
                    let err = StreamingError::SegmentNotFound {
                        period_id: String::new(),
                        time: target,
                    };
                    self.mark_error(content_type).await;
                    self.callbacks.on_error(&err);
                    Ok(StepOutcome::GapSurfaced)
                }
            }
            None => Ok(StepOutcome::Reschedule(Duration::from_secs(1))),
        }
    }

    /// Runs the retry policy to completion; on a NETWORK-category exhaustion
    /// error, consults `failureCallback` (spec.md §4.1) before giving up —
    /// a `true` answer restarts the retry sequence under the same policy.
    async fn fetch_with_failure_callback(
        &self,
        policy: &RetryPolicy,
        request_type: RequestType,
        request: &NetworkRequest,
    ) -> Result<crate::traits::NetworkResponse, StreamingError> {
        loop {
            let attempt = retry_with_backoff(policy, &self.token, |_attempt| {
                let req = request.clone();
                async move {
                    match self.network.request(request_type, req).await {
                        Ok(r) => RetryAction::Success(r),
                        Err(e) if e.is_retryable() => RetryAction::Retry(e),
                        Err(e) => RetryAction::Fail(e),
                    }
                }
            })
            .await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(err) if err.category() == "NETWORK" && self.callbacks.should_retry_after_failure(&err) => {
                    warn!(error = %err, "failureCallback requested another retry sequence");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_and_append_init(
        &self,
        content_type: ContentType,
        stream: &Arc<Stream>,
        config: &StreamingConfig,
    ) -> Result<(), StreamingError> {
        let Some(init_ref) = stream.segment_index.init_segment() else {
            return Ok(());
        };
        let request = NetworkRequest {
            uris: init_ref.uris.clone(),
            byte_range_start: init_ref.byte_range_start,
            byte_range_end: init_ref.byte_range_end,
        };

        let response = self
            .fetch_with_failure_callback(&config.retry_policy, RequestType::SegmentInit, &request)
            .await?;

        if content_type == ContentType::Text {
            self.text_engine.append_buffer(response.data, None, None).await?;
        } else {
            self.sink.append_buffer(content_type, response.data, None, None).await?;
        }
        Ok(())
    }

    async fn fetch_and_append_media(
        &self,
        content_type: ContentType,
        stream: &Arc<Stream>,
        segment_ref: &SegmentReference,
        config: &StreamingConfig,
        is_live: bool,
    ) -> Result<(), StreamingError> {
        let request = NetworkRequest {
            uris: segment_ref.uris.clone(),
            byte_range_start: segment_ref.byte_range_start,
            byte_range_end: segment_ref.byte_range_end,
        };

        let retry_policy = if is_live && config.infinite_retries_for_live_streams {
            RetryPolicy::infinite(config.retry_policy.base_delay, config.retry_policy.max_delay)
        } else {
            config.retry_policy.clone()
        };

        let response = self
            .fetch_with_failure_callback(&retry_policy, RequestType::SegmentMedia, &request)
            .await?;

        if content_type == ContentType::Video && stream.contains_emsg_boxes {
            match scan_emsg_boxes(&response.data, segment_ref.start_time) {
                Ok(scan) => {
                    if scan.manifest_update {
                        self.callbacks.on_manifest_update();
                    }
                    for event in scan.events {
                        self.callbacks.on_event(event);
                    }
                }
                Err(err) => warn!(error = %err, "failed to scan emsg boxes in video segment"),
            }
        }

        match content_type {
            ContentType::Text => {
                self.text_engine
                    .append_buffer(response.data, Some(segment_ref.start_time), Some(segment_ref.end_time))
                    .await?;
            }
            _ => {
                self.sink
                    .append_buffer(content_type, response.data, Some(segment_ref.start_time), Some(segment_ref.end_time))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_quota_exceeded(
        &self,
        content_type: ContentType,
        playhead_time: f64,
        config: &StreamingConfig,
    ) -> Result<StepOutcome, StreamingError> {
        let all_exhausted = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.media_states.get_mut(&content_type) else {
                return Ok(StepOutcome::Ended);
            };
            state.quota_retry_count += 1;
            inner.media_states.values().all(|s| s.quota_retry_count > 1)
        };

        if all_exhausted {
            let err = StreamingError::QuotaExceeded {
                content_type: format!("{content_type:?}"),
            };
            self.callbacks.on_error(&err);
            return Err(err);
        }

        self.evict_tail(content_type, playhead_time, config).await?;
        Ok(StepOutcome::Reschedule(Duration::from_millis(50)))
    }

    async fn evict_if_needed(
        &self,
        content_type: ContentType,
        playhead_time: f64,
        config: &StreamingConfig,
    ) -> Result<(), StreamingError> {
        let buffer_behind = config.buffer_goals.buffer_behind;
        let buffered_start = self.buffered_start_for(content_type).await;
        if playhead_time - buffered_start > buffer_behind {
            self.remove_buffer_range(content_type, 0.0, (playhead_time - buffer_behind).max(0.0)).await?;
        }
        Ok(())
    }

    async fn evict_tail(&self, content_type: ContentType, playhead_time: f64, config: &StreamingConfig) -> Result<(), StreamingError> {
        // Forced eviction on QUOTA_EXCEEDED: shrink harder than the steady
        // eviction target to free room for the retry.
        let target = (playhead_time - config.buffer_goals.buffer_behind / 2.0).max(0.0);
        self.remove_buffer_range(content_type, 0.0, target).await
    }

    fn all_types_at_final_segment_locked(inner: &Inner) -> bool {
        if inner.media_states.is_empty() {
            return false;
        }
        let is_last_period = inner.current_period_idx + 1 >= inner.periods.len();
        if !is_last_period {
            return false;
        }
        inner.media_states.values().all(|s| s.is_at_last_segment())
    }

    async fn mark_error(&self, content_type: ContentType) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.media_states.get_mut(&content_type) {
            state.has_error = true;
            state.phase = MediaStatePhase::Failed;
        }
    }

    // ---- Period transition (spec.md §4.1 "Period transition") ---------

    async fn transition_period(&self, next_period: &Period) -> Result<(), StreamingError> {
        let chosen = self.callbacks.on_choose_streams(next_period).await;

        let text_mime_change = {
            let mut inner = self.inner.lock().await;
            let idx = Self::period_index_for(&inner.periods, next_period.start_time).unwrap_or(inner.current_period_idx);
            inner.current_period_idx = idx;

            if let Some(s) = chosen.audio.clone() {
                Self::rebind_state(&mut inner.media_states, ContentType::Audio, s, &next_period.id);
            }
            if let Some(s) = chosen.video.clone() {
                Self::rebind_state(&mut inner.media_states, ContentType::Video, s, &next_period.id);
            }
            match chosen.text.clone() {
                Some(s) => {
                    let changed = inner
                        .media_states
                        .get(&ContentType::Text)
                        .map(|st| st.stream.mime_type != s.mime_type)
                        .unwrap_or(true);
                    Self::rebind_state(&mut inner.media_states, ContentType::Text, s, &next_period.id);
                    changed
                }
                None => false,
            }
        };

        if let Some(text_stream) = &chosen.text {
            if text_mime_change {
                self.sink.reinit_text(&text_stream.mime_type).await?;
                self.text_engine.init_parser(&text_stream.mime_type).await?;
            }
            self.text_engine.set_timestamp_offset(next_period.start_time).await;
        }

        self.callbacks.on_can_switch(next_period);
        Ok(())
    }

    fn rebind_state(states: &mut HashMap<ContentType, MediaState>, content_type: ContentType, stream: Arc<Stream>, period_id: &str) {
        match states.get_mut(&content_type) {
            Some(state) => state.set_stream(stream, period_id.to_string(), true),
            None => {
                states.insert(content_type, MediaState::new(content_type, stream, period_id.to_string()));
            }
        }
    }

    // ---- Public operations (spec.md §4.1 "Public operations") ----------

    /// Notify the engine that the playhead has moved; clears and re-queues
    /// affected types per spec.md's seek semantics.
    pub async fn seeked(&self) -> Result<(), StreamingError> {
        let playhead_time = self.playhead.get_time();
        let (target_idx, crosses_period, content_types) = {
            let inner = self.inner.lock().await;
            let target_idx = Self::period_index_for(&inner.periods, playhead_time);
            let crosses_period = target_idx.map(|idx| idx != inner.current_period_idx).unwrap_or(false);
            let content_types: Vec<ContentType> = inner.media_states.keys().copied().collect();
            (target_idx, crosses_period, content_types)
        };

        for content_type in &content_types {
            let buffered_start = self.buffered_start_for(*content_type).await;
            let buffered_end = self.buffered_end_for(*content_type).await;
            let in_range = playhead_time >= buffered_start && playhead_time < buffered_end;
            if in_range && !crosses_period {
                continue;
            }
            if *content_type == ContentType::Text {
                self.text_engine.remove(0.0, f64::INFINITY).await;
            } else {
                self.sink.clear(*content_type).await?;
            }
        }

        if crosses_period {
            if let Some(idx) = target_idx {
                let period = { self.inner.lock().await.periods[idx].clone() };
                self.transition_period(&period).await?;
            }
        }

        Ok(())
    }

    /// Substitute `content_type`'s active stream, optionally clearing its
    /// buffer first and always repopulating from the playhead onward.
    pub async fn switch(&self, content_type: ContentType, new_stream: Arc<Stream>, clear_buffer: bool) -> Result<(), StreamingError> {
        if clear_buffer {
            if content_type == ContentType::Text {
                self.text_engine.remove(0.0, f64::INFINITY).await;
            } else {
                self.sink.clear(content_type).await?;
            }
        }

        let mut inner = self.inner.lock().await;
        let period_id = inner.periods[inner.current_period_idx].id.clone();
        Self::rebind_state(&mut inner.media_states, content_type, new_stream, &period_id);
        Ok(())
    }

    pub async fn configure(&self, config: StreamingConfig) {
        let mut inner = self.inner.lock().await;
        inner.config = config;
    }

    /// Swap the active video stream with its trick-mode counterpart (or
    /// back), clearing the video buffer on either transition.
    pub async fn set_trick_play(&self, enabled: bool) -> Result<(), StreamingError> {
        let (already_set, period_id, swap_stream) = {
            let inner = self.inner.lock().await;
            if inner.trick_play_enabled == enabled {
                (true, String::new(), None)
            } else if let Some(state) = inner.media_states.get(&ContentType::Video) {
                let swap = if enabled {
                    state.stream.trick_mode_video.clone()
                } else {
                    state.last_stream.clone()
                };
                (false, state.current_period_id.clone(), swap)
            } else {
                (true, String::new(), None)
            }
        };

        if already_set {
            return Ok(());
        }
        let Some(new_stream) = swap_stream else {
            return Ok(());
        };

        self.sink.clear(ContentType::Video).await?;
        let mut inner = self.inner.lock().await;
        inner.trick_play_enabled = enabled;
        Self::rebind_state(&mut inner.media_states, ContentType::Video, new_stream, &period_id);
        Ok(())
    }

    /// Cancel all pending work and resolve once quiescent.
    pub async fn destroy(&self) {
        self.token.cancel();
        {
            let mut inner = self.inner.lock().await;
            inner.destroyed = true;
            for state in inner.media_states.values_mut() {
                state.phase = MediaStatePhase::Terminated;
            }
        }
        self.text_engine.destroy().await;
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) async fn test_state_period(&self, content_type: ContentType) -> Option<String> {
        self.inner
            .lock()
            .await
            .media_states
            .get(&content_type)
            .map(|s| s.current_period_id.clone())
    }

    #[cfg(test)]
    pub(crate) async fn test_has_media_state(&self, content_type: ContentType) -> bool {
        self.inner.lock().await.media_states.contains_key(&content_type)
    }
}

/// Drive every active content type's update loop cooperatively until each
/// reaches a terminal `StepOutcome` or `destroy()` cancels the shared token.
/// Spawns one task per content type, matching the teacher's one-task-per-
/// pipeline-stage structure; coordination across them happens only through
/// the shared `Mutex<Inner>` and the callbacks they invoke.
pub async fn run(engine: Arc<StreamingEngine>) {
    let content_types: Vec<ContentType> = {
        engine.inner.lock().await.media_states.keys().copied().collect()
    };

    let mut handles = Vec::new();
    for content_type in content_types {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if engine.token.is_cancelled() {
                    break;
                }
                match engine.step(content_type).await {
                    Ok(StepOutcome::Reschedule(delay)) => {
                        tokio::select! {
                            _ = engine.token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Ok(StepOutcome::PeriodTransitioned) => continue,
                    Ok(StepOutcome::Ended) | Ok(StepOutcome::GapSurfaced) => break,
                    Err(_) => break,
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InitSegmentReference, SegmentPosition, Variant};
    use crate::segment_index::VecSegmentIndex;
    use crate::traits::{ChosenStreams, EmsgEvent, NetworkResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use text_engine::TextCue;

    fn make_segments(count: u64, period_start: f64) -> Vec<SegmentReference> {
        (0..count)
            .map(|i| SegmentReference {
                position: SegmentPosition(i),
                start_time: period_start + i as f64 * 4.0,
                end_time: period_start + i as f64 * 4.0 + 4.0,
                uris: vec![format!("seg{i}.m4s")],
                byte_range_start: None,
                byte_range_end: None,
            })
            .collect()
    }

    fn make_stream(id: &str, period_id: &str, content_type: ContentType, period_start: f64, count: u64) -> Arc<Stream> {
        Arc::new(Stream {
            id: id.to_string(),
            period_id: period_id.to_string(),
            content_type,
            mime_type: match content_type {
                ContentType::Audio => "audio/mp4".to_string(),
                ContentType::Video | ContentType::TrickVideo => "video/mp4".to_string(),
                ContentType::Text => "text/vtt".to_string(),
            },
            init_segment: Some(InitSegmentReference {
                uris: vec!["init.mp4".to_string()],
                byte_range_start: None,
                byte_range_end: None,
            }),
            segment_index: Arc::new(VecSegmentIndex::new(
                Some(InitSegmentReference {
                    uris: vec!["init.mp4".to_string()],
                    byte_range_start: None,
                    byte_range_end: None,
                }),
                make_segments(count, period_start),
            )),
            contains_emsg_boxes: false,
            trick_mode_video: None,
        })
    }

    fn make_period(id: &str, start: f64, duration: f64, seg_count: u64) -> Period {
        let audio = make_stream(&format!("{id}_audio"), id, ContentType::Audio, start, seg_count);
        let video = make_stream(&format!("{id}_video"), id, ContentType::Video, start, seg_count);
        let text = make_stream(&format!("{id}_text"), id, ContentType::Text, start, seg_count);
        Period {
            id: id.to_string(),
            start_time: start,
            duration: Some(duration),
            variants: vec![Variant {
                id: format!("{id}_variant"),
                audio: Some(audio),
                video: Some(video),
                bandwidth: 1_000_000,
            }],
            text_streams: vec![text],
        }
    }

    struct FakePlayhead {
        time: StdMutex<f64>,
    }
    impl FakePlayhead {
        fn new(t: f64) -> Self {
            Self { time: StdMutex::new(t) }
        }
        fn set(&self, t: f64) {
            *self.time.lock().unwrap() = t;
        }
    }
    impl Playhead for FakePlayhead {
        fn get_time(&self) -> f64 {
            *self.time.lock().unwrap()
        }
    }

    struct FakeNetwork;
    #[async_trait]
    impl NetworkEngine for FakeNetwork {
        async fn request(&self, _request_type: RequestType, request: NetworkRequest) -> Result<NetworkResponse, StreamingError> {
            let uri = request.uris.first().cloned().unwrap_or_default();
            let data = if uri.contains("init") {
                bytes::Bytes::new()
            } else {
                bytes::Bytes::from_static(b"WEBVTT\n\n00:00:00.000 --> 00:00:01.000\nx\n")
            };
            Ok(NetworkResponse {
                data,
                uri,
                headers: HashMap::new(),
            })
        }
    }

    #[derive(Default)]
    struct FakeSink {
        buffered_end: StdMutex<HashMap<ContentType, f64>>,
        buffered_start: StdMutex<HashMap<ContentType, f64>>,
        ended: AtomicBool,
        end_of_stream_calls: AtomicU64,
        duration: StdMutex<f64>,
    }
    #[async_trait]
    impl MediaSink for FakeSink {
        async fn init(&self, _mime_map: HashMap<ContentType, String>) -> Result<(), StreamingError> {
            Ok(())
        }
        async fn set_duration(&self, duration: f64) -> Result<(), StreamingError> {
            *self.duration.lock().unwrap() = duration;
            Ok(())
        }
        async fn append_buffer(
            &self,
            content_type: ContentType,
            _data: bytes::Bytes,
            _start: Option<f64>,
            end: Option<f64>,
        ) -> Result<(), StreamingError> {
            if let Some(end) = end {
                let mut map = self.buffered_end.lock().unwrap();
                let entry = map.entry(content_type).or_insert(0.0);
                *entry = entry.max(end);
                self.buffered_start.lock().unwrap().entry(content_type).or_insert(0.0);
            }
            Ok(())
        }
        async fn remove(&self, content_type: ContentType, _start: f64, end: f64) -> Result<(), StreamingError> {
            self.buffered_start.lock().unwrap().insert(content_type, end);
            Ok(())
        }
        async fn clear(&self, content_type: ContentType) -> Result<(), StreamingError> {
            self.buffered_end.lock().unwrap().insert(content_type, 0.0);
            self.buffered_start.lock().unwrap().insert(content_type, 0.0);
            Ok(())
        }
        async fn reinit_text(&self, _mime: &str) -> Result<(), StreamingError> {
            Ok(())
        }
        async fn end_of_stream(&self) -> Result<(), StreamingError> {
            self.end_of_stream_calls.fetch_add(1, Ordering::SeqCst);
            self.ended.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn get_duration(&self) -> f64 {
            *self.duration.lock().unwrap()
        }
        fn buffered_end(&self, content_type: ContentType) -> f64 {
            *self.buffered_end.lock().unwrap().get(&content_type).unwrap_or(&0.0)
        }
        fn buffered_start(&self, content_type: ContentType) -> f64 {
            *self.buffered_start.lock().unwrap().get(&content_type).unwrap_or(&0.0)
        }
    }

    #[derive(Default)]
    struct FakeCallbacks {
        startup_complete: AtomicBool,
        errors: AtomicU64,
        suggested_seek: StdMutex<Option<f64>>,
    }
    #[async_trait]
    impl EngineCallbacks for FakeCallbacks {
        async fn on_choose_streams(&self, period: &Period) -> ChosenStreams {
            ChosenStreams {
                audio: period.variants.first().and_then(|v| v.audio.clone()),
                video: period.variants.first().and_then(|v| v.video.clone()),
                text: period.text_streams.first().cloned(),
            }
        }
        fn create_segment_index(&self, _stream: &Stream) -> Result<(), StreamingError> {
            Ok(())
        }
        fn on_can_switch(&self, _period: &Period) {}
        fn on_initial_streams_setup(&self) {}
        fn on_startup_complete(&self) {
            self.startup_complete.store(true, Ordering::SeqCst);
        }
        fn on_error(&self, _err: &StreamingError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_event(&self, _detail: EmsgEvent) {}
        fn on_manifest_update(&self) {}
        fn on_segment_appended(&self, _content_type: ContentType) {}
        fn on_playhead_seek_suggested(&self, time: f64) {
            *self.suggested_seek.lock().unwrap() = Some(time);
        }
    }

    struct NoopTextSink;
    impl TextTrackSink for NoopTextSink {
        fn add_cue(&self, _cue: &TextCue) {}
        fn remove_cue(&self, _cue: &TextCue) {}
    }

    fn make_engine(periods: Vec<Period>, timeline: PresentationTimeline, playhead_time: f64) -> (Arc<StreamingEngine>, Arc<FakeSink>, Arc<FakeCallbacks>, Arc<FakePlayhead>) {
        let sink = Arc::new(FakeSink::default());
        let callbacks = Arc::new(FakeCallbacks::default());
        let playhead = Arc::new(FakePlayhead::new(playhead_time));
        let engine = Arc::new(StreamingEngine::new(
            periods,
            timeline,
            StreamingConfig::default(),
            Arc::new(FakeNetwork),
            sink.clone(),
            playhead.clone(),
            callbacks.clone(),
            Arc::new(NoopTextSink),
        ));
        (engine, sink, callbacks, playhead)
    }

    #[tokio::test]
    async fn init_creates_media_states_for_all_three_types() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let (engine, _sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(8.0), 0.0);
        engine.init().await.unwrap();
        assert!(engine.test_has_media_state(ContentType::Audio).await);
        assert!(engine.test_has_media_state(ContentType::Video).await);
        assert!(engine.test_has_media_state(ContentType::Text).await);
    }

    #[tokio::test]
    async fn init_snaps_playhead_to_segment_start_when_configured() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let sink = Arc::new(FakeSink::default());
        let callbacks = Arc::new(FakeCallbacks::default());
        let playhead = Arc::new(FakePlayhead::new(5.0));
        let mut config = StreamingConfig::default();
        config.start_at_segment_boundary = true;
        let engine = Arc::new(StreamingEngine::new(
            periods,
            PresentationTimeline::vod(8.0),
            config,
            Arc::new(FakeNetwork),
            sink,
            playhead,
            callbacks.clone(),
            Arc::new(NoopTextSink),
        ));
        engine.init().await.unwrap();
        assert_eq!(*callbacks.suggested_seek.lock().unwrap(), Some(4.0));
    }

    #[tokio::test]
    async fn init_does_not_suggest_seek_when_boundary_already_matches() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let sink = Arc::new(FakeSink::default());
        let callbacks = Arc::new(FakeCallbacks::default());
        let playhead = Arc::new(FakePlayhead::new(0.0));
        let mut config = StreamingConfig::default();
        config.start_at_segment_boundary = true;
        let engine = Arc::new(StreamingEngine::new(
            periods,
            PresentationTimeline::vod(8.0),
            config,
            Arc::new(FakeNetwork),
            sink,
            playhead,
            callbacks.clone(),
            Arc::new(NoopTextSink),
        ));
        engine.init().await.unwrap();
        assert_eq!(*callbacks.suggested_seek.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn vod_two_periods_two_segments_each_reaches_end_of_stream() {
        // Scenario 1 (spec.md §8): VOD with 2 periods x 2 segments x
        // {audio,video,text}; expect all segments appended and
        // end_of_stream called exactly once.
        let periods = vec![make_period("p0", 0.0, 8.0, 2), make_period("p1", 8.0, 8.0, 2)];
        let (engine, sink, _callbacks, playhead) = make_engine(periods, PresentationTimeline::vod(16.0), 0.0);
        engine.init().await.unwrap();

        let mut iterations = 0;
        loop {
            iterations += 1;
            assert!(iterations < 200, "did not converge to end of stream");

            let mut any_active = false;
            for content_type in [ContentType::Audio, ContentType::Video, ContentType::Text] {
                if !engine.test_has_media_state(content_type).await {
                    continue;
                }
                match engine.step(content_type).await.unwrap() {
                    StepOutcome::Ended => {}
                    StepOutcome::Reschedule(_) | StepOutcome::PeriodTransitioned => any_active = true,
                    StepOutcome::GapSurfaced => any_active = true,
                }
            }
            // Playhead tracks the minimum buffered end so the loop keeps
            // advancing toward end of stream instead of throttling on
            // bufferingGoal forever.
            let mut min_end = f64::INFINITY;
            for content_type in [ContentType::Audio, ContentType::Video, ContentType::Text] {
                min_end = min_end.min(engine.buffered_end_for(content_type).await);
            }
            if min_end.is_finite() {
                playhead.set(min_end);
            }

            if !any_active {
                break;
            }
        }

        assert!(sink.ended.load(Ordering::SeqCst));
        assert_eq!(sink.end_of_stream_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.buffered_end(ContentType::Audio), 16.0);
        assert_eq!(sink.buffered_end(ContentType::Video), 16.0);
    }

    #[tokio::test]
    async fn concurrent_final_ticks_call_end_of_stream_exactly_once() {
        // Regression for the race where every content type's task observes
        // the unanimous final-segment condition before any of them has
        // flipped `end_of_stream`, and each calls `sink.end_of_stream()`.
        // Drive every type to its single segment, then race many concurrent
        // `step()` calls across all three content types at once.
        let periods = vec![make_period("p0", 0.0, 4.0, 1)];
        let (engine, sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(4.0), 0.0);
        engine.init().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            for content_type in [ContentType::Audio, ContentType::Video, ContentType::Text] {
                let engine = engine.clone();
                handles.push(tokio::spawn(async move { engine.step(content_type).await }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        assert!(sink.end_of_stream_calls.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn seek_backward_clears_buffer_and_refetches_from_new_playhead() {
        // Scenario 3 (spec.md §8): seek backward across period boundary.
        let periods = vec![make_period("p0", 0.0, 8.0, 2), make_period("p1", 8.0, 100.0, 25)];
        let (engine, sink, _callbacks, playhead) = make_engine(periods, PresentationTimeline::vod(108.0), 26.0);
        engine.init().await.unwrap();
        // drive a couple of ticks in period 2 before seeking back.
        for _ in 0..2 {
            let _ = engine.step(ContentType::Audio).await;
        }

        playhead.set(6.0);
        engine.seeked().await.unwrap();
        assert_eq!(sink.buffered_start(ContentType::Audio), 0.0);

        for _ in 0..4 {
            let outcome = engine.step(ContentType::Audio).await.unwrap();
            if matches!(outcome, StepOutcome::Reschedule(_)) {
                let end = sink.buffered_end(ContentType::Audio);
                if end > 6.0 {
                    playhead.set(end.min(8.0));
                }
            }
        }

        assert_eq!(engine.test_state_period(ContentType::Audio).await.unwrap(), "p0");
    }

    #[tokio::test]
    async fn destroy_cancels_the_token_and_terminates_media_states() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let (engine, _sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(8.0), 0.0);
        engine.init().await.unwrap();
        engine.destroy().await;
        assert!(engine.is_destroyed());
        let result = engine.step(ContentType::Audio).await;
        assert!(matches!(result, Err(StreamingError::Cancelled)));
    }

    #[tokio::test]
    async fn set_trick_play_without_trick_stream_is_a_no_op() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let (engine, sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(8.0), 0.0);
        engine.init().await.unwrap();
        engine.set_trick_play(true).await.unwrap();
        assert_eq!(sink.buffered_end(ContentType::Video), 0.0);
    }

    #[tokio::test]
    async fn concurrent_ticks_across_content_types_do_not_deadlock() {
        use futures::future::join_all;

        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let (engine, _sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(8.0), 0.0);
        engine.init().await.unwrap();

        let futs = [ContentType::Audio, ContentType::Video, ContentType::Text]
            .into_iter()
            .map(|content_type| {
                let engine = engine.clone();
                async move { engine.step(content_type).await }
            });
        let results = join_all(futs).await;
        assert!(results.into_iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn switch_rebinds_media_state_and_requests_init_segment_again() {
        let periods = vec![make_period("p0", 0.0, 8.0, 2)];
        let (engine, _sink, _callbacks, _playhead) = make_engine(periods, PresentationTimeline::vod(8.0), 0.0);
        engine.init().await.unwrap();
        let new_stream = make_stream("p0_audio_alt", "p0", ContentType::Audio, 0.0, 2);
        engine.switch(ContentType::Audio, new_stream, false).await.unwrap();
        assert!(engine.test_has_media_state(ContentType::Audio).await);
    }
}
