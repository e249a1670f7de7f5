//! External collaborators, modeled as narrow trait seams exactly the way
//! `mesio-engine::hls` defines `SegmentDownloader`/`SegmentTransformer`:
//! one trait per capability, constructed once by the caller and handed to
//! the orchestrator by value. The orchestrator never holds a reference back
//! to whoever constructed it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StreamingError;
use crate::model::{ContentType, Period, Stream};

/// What kind of fetch a `NetworkEngine::request` call is servicing, mirrored
/// on the request so retry/backoff policy can vary by purpose if desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    SegmentInit,
    SegmentMedia,
    Manifest,
}

#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub uris: Vec<String>,
    pub byte_range_start: Option<u64>,
    pub byte_range_end: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub data: Bytes,
    pub uri: String,
    pub headers: HashMap<String, String>,
}

/// Issues retried HTTP-like requests, out of core scope per spec.md §1 —
/// the core only consumes this trait.
#[async_trait]
pub trait NetworkEngine: Send + Sync {
    async fn request(
        &self,
        request_type: RequestType,
        request: NetworkRequest,
    ) -> Result<NetworkResponse, StreamingError>;
}

/// Opaque sink accepting init+media byte buffers per content type; out of
/// core scope, narrowed to the operations spec.md §6 names.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn init(&self, mime_map: HashMap<ContentType, String>) -> Result<(), StreamingError>;
    async fn set_duration(&self, duration: f64) -> Result<(), StreamingError>;
    async fn append_buffer(
        &self,
        content_type: ContentType,
        data: Bytes,
        start: Option<f64>,
        end: Option<f64>,
    ) -> Result<(), StreamingError>;
    async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<(), StreamingError>;
    async fn clear(&self, content_type: ContentType) -> Result<(), StreamingError>;
    async fn reinit_text(&self, mime: &str) -> Result<(), StreamingError>;
    async fn end_of_stream(&self) -> Result<(), StreamingError>;
    fn get_duration(&self) -> f64;
    /// Buffered end (seconds) for `content_type`, or 0.0 if nothing buffered.
    fn buffered_end(&self, content_type: ContentType) -> f64;
    /// Buffered start (seconds) for `content_type`, or `buffered_end` if nothing buffered.
    fn buffered_start(&self, content_type: ContentType) -> f64;
}

/// Provides current playback time; out of core scope.
pub trait Playhead: Send + Sync {
    fn get_time(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct ChosenStreams {
    pub audio: Option<Arc<Stream>>,
    pub video: Option<Arc<Stream>>,
    pub text: Option<Arc<Stream>>,
}

/// `emsg` event payload per spec.md §6.
#[derive(Debug, Clone)]
pub struct EmsgEvent {
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    pub presentation_time_delta: u32,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
    pub start_time: f64,
    pub end_time: f64,
}

/// Narrow *engine callbacks* value: a record of function-typed fields in
/// spirit, expressed as a trait so the orchestrator holds one boxed
/// implementation rather than N separate closures.
#[async_trait]
pub trait EngineCallbacks: Send + Sync {
    async fn on_choose_streams(&self, period: &Period) -> ChosenStreams;
    /// Build (or validate) `stream`'s segment index. Spec.md §4.1's startup
    /// protocol step 4 fails `init()` on the first such failure across all
    /// chosen streams; out-of-core in practice (the manifest parser already
    /// constructs `Stream::segment_index` lazily), but modeled as a hook so
    /// the orchestrator can surface that failure per the contract.
    fn create_segment_index(&self, stream: &Stream) -> Result<(), StreamingError>;
    fn on_can_switch(&self, period: &Period);
    fn on_initial_streams_setup(&self);
    fn on_startup_complete(&self);
    fn on_error(&self, err: &StreamingError);
    fn on_event(&self, detail: EmsgEvent);
    fn on_manifest_update(&self);
    fn on_segment_appended(&self, content_type: ContentType);

    /// `failureCallback` (spec.md §4.1 config): consulted once a NETWORK
    /// error's retries are exhausted, before the engine surfaces it via
    /// `on_error`. Returning `true` asks the engine to keep retrying (the
    /// retry sequence restarts under the same policy); `false` (the
    /// default) surfaces the error as spec.md describes without this hook.
    fn should_retry_after_failure(&self, _err: &StreamingError) -> bool {
        false
    }

    /// `startAtSegmentBoundary` (spec.md §4.1 config): called once during
    /// `init()` with the start time of the segment containing the initial
    /// playhead position, when that config flag is set and it differs from
    /// the playhead's own reported time. `Playhead` is read-only from the
    /// orchestrator's side, so repositioning the actual playback time is the
    /// host's responsibility; the default no-op leaves the playhead alone.
    fn on_playhead_seek_suggested(&self, _time: f64) {}
}
