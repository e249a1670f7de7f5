//! In-memory timed-text cue store, parser plug-in registry, and the VTT /
//! MP4-embedded VTT / MP4-embedded TTML parsers that feed it.
//!
//! [`TextEngine`] owns a sorted [`cue::CueStore`] and the active track's
//! [`parser::TextParser`]; parsers are looked up by MIME type through a
//! shared [`parser::ParserRegistry`] so one registry can back every track in
//! a process, the way a `mesio-engine` coordinator shares its trait-object
//! collaborators across streams via `Arc`.

mod cue;
mod engine;
mod error;
mod fragment;
mod mp4_ttml;
mod mp4_vtt;
mod parser;
mod vtt;

pub use cue::{
    CueAlign, CueLine, CueLineAlign, CuePositionAlign, CueSettings, CueVertical, TextCue,
};
pub use engine::{TextEngine, TextTrackSink};
pub use error::TextError;
pub use mp4_ttml::Mp4TtmlParser;
pub use mp4_vtt::Mp4VttParser;
pub use parser::{ParserRegistry, ParserTime, TextParser, TextParserFactory};
pub use vtt::{parse_vtt, VttParser};

/// Register the built-in `text/vtt`, `application/mp4` (`wvtt`), and
/// `application/mp4` (`stpp`) parsers under the MIME types the manifest
/// parser is expected to hand `TextEngine::init_parser`.
pub fn register_builtin_parsers(registry: &ParserRegistry) {
    registry.register("text/vtt", Box::new(|| Box::new(VttParser) as Box<dyn TextParser>));
    registry.register(
        "application/mp4;codecs=\"wvtt\"",
        Box::new(|| Box::new(Mp4VttParser::new()) as Box<dyn TextParser>),
    );
    registry.register(
        "application/mp4;codecs=\"stpp\"",
        Box::new(|| Box::new(Mp4TtmlParser::new()) as Box<dyn TextParser>),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_builtin_parsers_covers_all_three_mime_types() {
        let registry = ParserRegistry::new();
        register_builtin_parsers(&registry);
        assert!(registry.is_registered("text/vtt"));
        assert!(registry.is_registered("application/mp4;codecs=\"wvtt\""));
        assert!(registry.is_registered("application/mp4;codecs=\"stpp\""));
    }
}
