//! [`TextEngine`]: holds the sorted cue store, owns the active track's
//! parser, and applies append-window filtering before handing cues to the
//! external track sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cue::{CueStore, TextCue};
use crate::error::TextError;
use crate::parser::{ParserRegistry, ParserTime, TextParser};

/// Callback sink a `TextEngine` reports cue changes to; analogous to the
/// media sink's `addCue`/`removeCue` track API, kept as a narrow trait so
/// `TextEngine` never holds a reference back to its owner.
pub trait TextTrackSink: Send + Sync {
    fn add_cue(&self, cue: &TextCue);
    fn remove_cue(&self, cue: &TextCue);
}

struct EngineState {
    store: CueStore,
    parser: Option<Box<dyn TextParser>>,
    period_start: f64,
    append_window_end: f64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            store: CueStore::new(),
            parser: None,
            period_start: 0.0,
            append_window_end: f64::INFINITY,
        }
    }
}

/// In-memory timed-text cue store driven by pluggable parsers.
///
/// `destroy()` is safe to call concurrently with a pending `append_buffer`
/// or `remove`: the in-flight call completes against the state it already
/// holds the lock for, and every subsequent call becomes a no-op.
pub struct TextEngine {
    registry: Arc<ParserRegistry>,
    sink: Arc<dyn TextTrackSink>,
    state: Mutex<EngineState>,
    destroyed: AtomicBool,
}

impl TextEngine {
    pub fn new(registry: Arc<ParserRegistry>, sink: Arc<dyn TextTrackSink>) -> Self {
        Self {
            registry,
            sink,
            state: Mutex::new(EngineState::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn is_type_supported(&self, mime_type: &str) -> bool {
        self.registry.is_registered(mime_type)
    }

    /// Instantiate the registered parser for `mime_type` and retain it for
    /// subsequent `append_buffer` calls.
    pub async fn init_parser(&self, mime_type: &str) -> Result<(), TextError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let parser = self.registry.create(mime_type)?;
        let mut state = self.state.lock().await;
        state.parser = Some(parser);
        Ok(())
    }

    /// Parse `data` (an init segment if `segment_start`/`segment_end` are
    /// `None`, otherwise a media segment) and append surviving cues.
    pub async fn append_buffer(
        &self,
        data: Bytes,
        segment_start: Option<f64>,
        segment_end: Option<f64>,
    ) -> Result<(), TextError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(parser) = state.parser.as_mut() else {
            return Err(TextError::UnsupportedMime("no parser initialized".to_string()));
        };

        let (Some(start), Some(_end)) = (segment_start, segment_end) else {
            return parser.parse_init(&data);
        };

        let time = ParserTime {
            segment_start: start,
            period_start: state.period_start,
        };
        let cues = parser.parse_media(&data, time)?;

        let append_window_end = state.append_window_end;
        let mut inserted = 0;
        for cue in cues {
            if cue.start_time >= append_window_end {
                debug!(start_time = cue.start_time, append_window_end, "dropping cue past append window");
                continue;
            }
            state.store.insert(cue.clone());
            self.sink.add_cue(&cue);
            inserted += 1;
        }
        debug!(inserted, "appended text cues");
        Ok(())
    }

    /// Remove cues overlapping `[start, end)`, notifying the sink for each.
    pub async fn remove(&self, start: f64, end: f64) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().await;
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        for cue in state.store.remove(start, end) {
            self.sink.remove_cue(&cue);
        }
    }

    pub async fn set_timestamp_offset(&self, period_start: f64) {
        let mut state = self.state.lock().await;
        state.period_start = period_start;
    }

    pub async fn set_append_window_end(&self, t: f64) {
        let mut state = self.state.lock().await;
        state.append_window_end = t;
    }

    pub async fn buffer_start(&self) -> Option<f64> {
        self.state.lock().await.store.buffer_start()
    }

    pub async fn buffer_end(&self) -> Option<f64> {
        self.state.lock().await.store.buffer_end()
    }

    pub async fn buffered_ahead_of(&self, t: f64) -> f64 {
        let state = self.state.lock().await;
        state.store.buffered_ahead_of(t, state.append_window_end)
    }

    /// Mark the engine destroyed. Already in-flight `append_buffer`/`remove`
    /// calls finish normally (they're holding the state lock or have already
    /// released it); every call made after this returns becomes a no-op.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().await;
        state.parser = None;
        warn!("text engine destroyed");
    }
}
