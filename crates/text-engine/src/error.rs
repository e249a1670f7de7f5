use thiserror::Error;

/// Errors raised while parsing or appending timed-text cues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error("invalid text header: {0}")]
    InvalidTextHeader(String),

    #[error("invalid text cue: {0}")]
    InvalidTextCue(String),

    #[error("invalid mp4 vtt init segment: {0}")]
    InvalidMp4Vtt(String),

    #[error("invalid mp4 ttml init segment: {0}")]
    InvalidMp4Ttml(String),

    #[error("no parser registered for mime type `{0}`")]
    UnsupportedMime(String),
}
