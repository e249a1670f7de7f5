use text_engine::TextError;
use thiserror::Error;

/// Errors surfaced by the streaming core, grouped the way the network-fetch
/// error enum this crate was modeled on groups HTTP/IO/protocol failures:
/// one flat enum, classification via methods rather than a parallel
/// category type.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("network request failed: {reason}")]
    Network { reason: String, retryable: bool },

    #[error("media append rejected by sink: {reason}")]
    MediaAppend { reason: String },

    #[error("media sink quota exceeded for {content_type}")]
    QuotaExceeded { content_type: String },

    #[error("failed to build segment index for stream {stream_id}: {reason}")]
    SegmentIndexBuild { stream_id: String, reason: String },

    #[error("no segment available at time {time} in period {period_id}")]
    SegmentNotFound { period_id: String, time: f64 },

    #[error("text pipeline error: {source}")]
    Text {
        #[from]
        source: TextError,
    },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("invalid emsg box: {reason}")]
    InvalidEmsg { reason: String },

    #[error("retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl StreamingError {
    pub fn network(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Network {
            reason: reason.into(),
            retryable,
        }
    }

    /// NETWORK/MEDIA/TEXT/STORAGE category, mirroring the four categories
    /// this crate's error table is organized around.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Cancelled | Self::Network { .. } | Self::RetriesExhausted { .. } => "NETWORK",
            Self::MediaAppend { .. } | Self::QuotaExceeded { .. } | Self::InvalidEmsg { .. } => "MEDIA",
            Self::Text { .. } => "TEXT",
            Self::Storage { .. } => "STORAGE",
            Self::SegmentIndexBuild { .. } | Self::SegmentNotFound { .. } | Self::Internal { .. } => "MEDIA",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Network { retryable, .. } => *retryable,
            Self::QuotaExceeded { .. } => true,
            Self::SegmentNotFound { .. } => true,
            Self::MediaAppend { .. }
            | Self::SegmentIndexBuild { .. }
            | Self::Text { .. }
            | Self::Storage { .. }
            | Self::InvalidEmsg { .. }
            | Self::RetriesExhausted { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// A CRITICAL-severity error that should tear down the affected
    /// MediaState rather than retry, distinct from a recoverable NETWORK
    /// hiccup.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::SegmentIndexBuild { .. } | Self::MediaAppend { .. } | Self::Internal { .. }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
