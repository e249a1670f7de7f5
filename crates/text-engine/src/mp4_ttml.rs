//! MP4-embedded TTML (`stpp`) parser.
//!
//! Each `trun` sample holds one complete TTML document (no further ISOBMFF
//! boxing inside the sample, unlike `wvtt`). This extracts `<p begin="..."
//! end="...">` elements with a light-weight scan rather than a general XML
//! parser, since the only structure that matters for cue timing is that
//! fixed element shape. The element's inner XML is kept verbatim as the
//! cue payload — rendering TTML markup (`<span>`, `<br/>`, styling) is a
//! downstream concern, not this parser's.

use bytes::Bytes;
use regex::Regex;
use std::sync::OnceLock;

use crate::cue::TextCue;
use crate::error::TextError;
use crate::fragment::{fragment_samples, init_segment_timescale, validate_sample_entry};
use crate::parser::{ParserTime, TextParser};

const DEFAULT_TIMESCALE: u32 = 1000;

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<p\b[^>]*\bbegin="(?P<begin>[^"]+)"[^>]*\bend="(?P<end>[^"]+)"[^>]*>(?P<body>.*?)</p>"#,
        )
        .expect("static TTML paragraph regex is valid")
    })
}

/// Parse a TTML clock-time value (`HH:MM:SS.mmm` or `HH:MM:SS:FF`-style
/// frames are not supported, matching the subset this player's segments
/// actually produce) into seconds.
fn parse_ttml_time(raw: &str) -> Result<f64, TextError> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(TextError::InvalidMp4Ttml(format!("bad timestamp `{raw}`")));
    };
    let hours: f64 = h
        .parse()
        .map_err(|_| TextError::InvalidMp4Ttml(format!("bad timestamp `{raw}`")))?;
    let minutes: f64 = m
        .parse()
        .map_err(|_| TextError::InvalidMp4Ttml(format!("bad timestamp `{raw}`")))?;
    let seconds: f64 = s
        .parse()
        .map_err(|_| TextError::InvalidMp4Ttml(format!("bad timestamp `{raw}`")))?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse one sample's TTML document body into cues. `sample_start` anchors
/// the document's own `begin`/`end` offsets (which are relative to the
/// document, not the presentation timeline) to presentation time.
///
/// The cue payload carries the `<p>` element's raw inner XML untouched —
/// spec.md §4.3: "TTML emits cues carrying raw XML payload to be rendered
/// later" — so nested `<span>`/`<br/>` styling survives for whatever
/// renders the cue downstream.
fn parse_ttml_document(xml: &str, sample_start: f64) -> Result<Vec<TextCue>, TextError> {
    let mut cues = Vec::new();
    for caps in paragraph_re().captures_iter(xml) {
        let begin = parse_ttml_time(&caps["begin"])?;
        let end = parse_ttml_time(&caps["end"])?;
        let payload = caps["body"].trim().to_string();
        cues.push(TextCue::new(sample_start + begin, sample_start + end, payload));
    }
    Ok(cues)
}

#[derive(Debug, Default)]
pub struct Mp4TtmlParser {
    timescale: Option<u32>,
}

impl Mp4TtmlParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn timescale(&self) -> u32 {
        self.timescale.unwrap_or(DEFAULT_TIMESCALE)
    }
}

#[async_trait::async_trait]
impl TextParser for Mp4TtmlParser {
    fn parse_init(&mut self, data: &Bytes) -> Result<(), TextError> {
        validate_sample_entry(data, b"stpp", TextError::InvalidMp4Ttml)?;
        self.timescale = Some(init_segment_timescale(data, TextError::InvalidMp4Ttml)?);
        Ok(())
    }

    fn parse_media(&mut self, data: &Bytes, time: ParserTime) -> Result<Vec<TextCue>, TextError> {
        // `tfdt` is period-relative in an ISOBMFF fragment, so presentation
        // time is anchored to `period_start`, not `segment_start` (unlike
        // standalone VTT) — spec.md §4.3.
        let samples = fragment_samples(data, self.timescale(), time.period_start)?;

        let mut cues = Vec::new();
        for sample in samples {
            let xml = std::str::from_utf8(&data[sample.body_start..sample.body_end])
                .map_err(|e| TextError::InvalidMp4Ttml(format!("not valid utf-8: {e}")))?;
            cues.extend(parse_ttml_document(xml, sample.start)?);
        }
        Ok(cues)
    }
}
