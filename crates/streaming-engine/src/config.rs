//! Aggregated configuration, shaped the way this workspace's per-pipeline
//! config aggregates nested sub-configs with a `Default` impl per knob
//! group rather than one flat struct.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Gap-jumping thresholds for when a `MediaState` can't find a segment at
/// its target time mid-period.
#[derive(Debug, Clone)]
pub struct GapJumpConfig {
    /// Gaps at most this many seconds wide are jumped silently.
    pub small_gap_limit: f64,
    /// Whether gaps larger than `small_gap_limit` are jumped at all.
    pub jump_large_gaps: bool,
}

impl Default for GapJumpConfig {
    fn default() -> Self {
        Self {
            small_gap_limit: 0.5,
            jump_large_gaps: false,
        }
    }
}

/// Eviction and buffering targets for the per-type fetch/append loop.
#[derive(Debug, Clone)]
pub struct BufferGoals {
    /// Target seconds of buffer ahead of the playhead.
    pub buffering_goal: f64,
    /// Minimum buffered seconds required before startup is declared complete.
    pub rebuffering_goal: f64,
    /// Maximum seconds of buffer retained behind the playhead.
    pub buffer_behind: f64,
}

impl Default for BufferGoals {
    fn default() -> Self {
        Self {
            buffering_goal: 10.0,
            rebuffering_goal: 2.0,
            buffer_behind: 30.0,
        }
    }
}

/// Top-level engine configuration, analogous to this workspace's
/// `HlsConfig` aggregate.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub buffer_goals: BufferGoals,
    pub retry_policy: RetryPolicy,
    /// If true, transient NETWORK errors on live content retry forever
    /// instead of surfacing after `retry_policy.max_retries`.
    pub infinite_retries_for_live_streams: bool,
    /// If true, TEXT-category errors are logged and that MediaState is
    /// disabled rather than surfaced to `EngineCallbacks`.
    pub ignore_text_stream_failures: bool,
    /// Snap the initial playhead to the nearest segment boundary at startup.
    pub start_at_segment_boundary: bool,
    pub gap_jump: GapJumpConfig,
    /// Epsilon kept inside the live availability window's edges before a
    /// fetch target is accepted.
    pub live_edge_epsilon: f64,
    /// Minimum interval between consecutive update-loop ticks for a given
    /// MediaState, to bound scheduling churn.
    pub min_update_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_goals: BufferGoals::default(),
            retry_policy: RetryPolicy::default(),
            infinite_retries_for_live_streams: true,
            ignore_text_stream_failures: false,
            start_at_segment_boundary: false,
            gap_jump: GapJumpConfig::default(),
            live_edge_epsilon: 0.1,
            min_update_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_buffer_ordering() {
        let cfg = StreamingConfig::default();
        assert!(cfg.buffer_goals.rebuffering_goal <= cfg.buffer_goals.buffering_goal);
        assert!(cfg.buffer_goals.buffer_behind > 0.0);
    }
}
