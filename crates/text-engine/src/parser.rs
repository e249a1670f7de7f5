//! Pluggable cue-parser registry.
//!
//! Mirrors the `Box<dyn Processor<T>>` plug-in pattern used for media
//! pipelines: each MIME type resolves to a parser implementation, and
//! `TextEngine` dispatches to whichever one is registered for the track's
//! declared type instead of hard-coding format knowledge.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cue::TextCue;
use crate::error::TextError;

/// Carries the timing context a parser needs to turn on-the-wire cue
/// timestamps into presentation-timeline seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserTime {
    /// Offset added to every parsed cue's start/end time (seconds).
    pub segment_start: f64,
    /// `X-TIMESTAMP-MAP` / media-segment period start, set via
    /// `setTimestampOffset`.
    pub period_start: f64,
}

/// A cue-track parser. Implementations may be stateless (pure VTT text) or
/// stateful (MP4-embedded tracks that must remember `moov`-level defaults
/// parsed out of an init segment before any media segment can be parsed).
#[async_trait]
pub trait TextParser: Send + Sync {
    /// Parse an initialization segment, if the format has one. Default is a
    /// no-op for formats like plain VTT that carry no init segment.
    fn parse_init(&mut self, _data: &Bytes) -> Result<(), TextError> {
        Ok(())
    }

    /// Parse one media segment into zero or more cues.
    fn parse_media(&mut self, data: &Bytes, time: ParserTime) -> Result<Vec<TextCue>, TextError>;
}

/// A factory for stateful parsers: `TextEngine::init_parser` constructs a
/// fresh instance per track so concurrent tracks never share parser state.
pub trait TextParserFactory: Send + Sync {
    fn create(&self) -> Box<dyn TextParser>;
}

impl<F> TextParserFactory for F
where
    F: Fn() -> Box<dyn TextParser> + Send + Sync,
{
    fn create(&self) -> Box<dyn TextParser> {
        (self)()
    }
}

/// MIME type -> parser factory map, analogous to the pipeline's processor
/// registry but keyed by content type instead of position in a chain.
pub struct ParserRegistry {
    factories: Mutex<HashMap<String, Box<dyn TextParserFactory>>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the factory for `mime_type`.
    pub fn register(&self, mime_type: impl Into<String>, factory: Box<dyn TextParserFactory>) {
        self.factories
            .lock()
            .expect("parser registry mutex poisoned")
            .insert(mime_type.into(), factory);
    }

    pub fn is_registered(&self, mime_type: &str) -> bool {
        self.factories
            .lock()
            .expect("parser registry mutex poisoned")
            .contains_key(mime_type)
    }

    /// Construct a fresh parser instance for `mime_type`.
    pub fn create(&self, mime_type: &str) -> Result<Box<dyn TextParser>, TextError> {
        self.factories
            .lock()
            .expect("parser registry mutex poisoned")
            .get(mime_type)
            .map(|factory| factory.create())
            .ok_or_else(|| TextError::UnsupportedMime(mime_type.to_string()))
    }
}
