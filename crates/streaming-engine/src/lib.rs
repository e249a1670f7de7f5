//! Adaptive streaming core: the data model, segment index, per-content-type
//! `MediaState` update loop, and the `StreamingEngine` orchestrator that
//! drives them — the subsystem that continuously selects, fetches, parses,
//! and appends media segments to a downstream sink so playback proceeds
//! smoothly across period boundaries, quality switches, seeks, live-window
//! sliding, and recoverable errors.

mod config;
mod emsg;
mod engine;
mod error;
mod media_state;
mod model;
mod retry;
mod segment_index;
mod traits;

pub use config::{BufferGoals, GapJumpConfig, StreamingConfig};
pub use emsg::{scan_emsg_boxes, EmsgScanResult, MANIFEST_UPDATE_SCHEME};
pub use engine::{run, StepOutcome, StreamingEngine};
pub use error::StreamingError;
pub use media_state::{MediaState, MediaStatePhase};
pub use model::{
    ContentType, InitSegmentReference, Period, PresentationTimeline, SegmentPosition, SegmentReference, Stream, Variant,
};
pub use retry::{retry_with_backoff, RetryAction, RetryPolicy};
pub use segment_index::{SegmentIndex, VecSegmentIndex};
pub use traits::{
    ChosenStreams, EmsgEvent, EngineCallbacks, MediaSink, NetworkEngine, NetworkRequest, NetworkResponse, Playhead, RequestType,
};
