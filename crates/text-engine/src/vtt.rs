//! WebVTT parser.
//!
//! Parses a complete `WEBVTT` text payload (either a standalone `.vtt`
//! resource or the text extracted from a single media segment) into
//! [`TextCue`]s. Stateless: every call to [`VttParser::parse_media`] parses
//! its input independently, since plain VTT carries no persistent init-segment
//! state between segments.

use bytes::Bytes;
use regex::Regex;
use std::sync::OnceLock;

use crate::cue::{CueAlign, CueLine, CueLineAlign, CuePositionAlign, CueSettings, CueVertical, TextCue};
use crate::error::TextError;
use crate::parser::{ParserTime, TextParser};

fn timing_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^\s*
            (?P<start>\d{2,}:\d{2}:\d{2}\.\d{3}|\d{2}:\d{2}\.\d{3})
            \s*-->\s*
            (?P<end>\d{2,}:\d{2}:\d{2}\.\d{3}|\d{2}:\d{2}\.\d{3})
            \s*
            (?P<settings>.*)
            $",
        )
        .expect("static timing line regex is valid")
    })
}

fn settings_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<key>[a-zA-Z]+):(?P<value>\S+)").expect("static settings token regex is valid")
    })
}

fn timestamp_map_local_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"LOCAL:(?P<local>[\d:.]+)").expect("static LOCAL regex is valid"))
}

fn timestamp_map_mpegts_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"MPEGTS:(?P<mpegts>\d+)").expect("static MPEGTS regex is valid"))
}

/// Parse a `HH:MM:SS.mmm` or `MM:SS.mmm` VTT timestamp into seconds.
fn parse_timestamp(raw: &str) -> Result<f64, TextError> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (hours, minutes, rest) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok(), m.parse::<f64>().ok(), *s),
        [m, s] => (Some(0.0), m.parse::<f64>().ok(), *s),
        _ => (None, None, ""),
    };
    let hours = hours.ok_or_else(|| TextError::InvalidTextCue(format!("bad timestamp `{raw}`")))?;
    let minutes = minutes.ok_or_else(|| TextError::InvalidTextCue(format!("bad timestamp `{raw}`")))?;
    let seconds: f64 = rest
        .parse()
        .map_err(|_| TextError::InvalidTextCue(format!("bad timestamp `{raw}`")))?;
    if minutes >= 60.0 || seconds >= 60.0 {
        return Err(TextError::InvalidTextCue(format!(
            "minutes/seconds out of range in `{raw}`"
        )));
    }
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn parse_settings(raw: &str) -> CueSettings {
    let mut settings = CueSettings::default();
    for cap in settings_token_re().captures_iter(raw) {
        let key = &cap["key"];
        let value = &cap["value"];
        match key {
            "align" => {
                settings.align = match value {
                    "start" => Some(CueAlign::Start),
                    "middle" => Some(CueAlign::Middle),
                    "center" => Some(CueAlign::Center),
                    "end" => Some(CueAlign::End),
                    "left" => Some(CueAlign::Left),
                    "right" => Some(CueAlign::Right),
                    _ => None,
                };
            }
            "vertical" => {
                settings.vertical = match value {
                    "rl" => Some(CueVertical::RightToLeft),
                    "lr" => Some(CueVertical::LeftToRight),
                    _ => None,
                };
            }
            "size" => {
                settings.size = value.trim_end_matches('%').parse().ok();
            }
            "position" => {
                let (pos_part, align_part) = match value.split_once(',') {
                    Some((p, a)) => (p, Some(a)),
                    None => (value, None),
                };
                settings.position = pos_part.trim_end_matches('%').parse().ok();
                if let Some(align) = align_part {
                    settings.position_align = match align {
                        "line-left" => Some(CuePositionAlign::LineLeft),
                        "line-right" => Some(CuePositionAlign::LineRight),
                        "center" => Some(CuePositionAlign::Center),
                        "start" => Some(CuePositionAlign::Start),
                        "end" => Some(CuePositionAlign::End),
                        _ => None,
                    };
                }
            }
            "line" => {
                let (line_part, align_part) = match value.split_once(',') {
                    Some((l, a)) => (l, Some(a)),
                    None => (value, None),
                };
                settings.snap_to_lines = !line_part.ends_with('%');
                settings.line = if let Some(pct) = line_part.strip_suffix('%') {
                    pct.parse().ok().map(CueLine::Percent)
                } else {
                    line_part.parse().ok().map(CueLine::Number)
                };
                if let Some(align) = align_part {
                    settings.line_align = match align {
                        "start" => Some(CueLineAlign::Start),
                        "end" => Some(CueLineAlign::End),
                        "center" => Some(CueLineAlign::Center),
                        _ => None,
                    };
                }
            }
            _ => {}
        }
    }
    if settings.align == Some(CueAlign::Center) {
        settings.align = Some(CueAlign::Middle);
        settings.position = None;
        settings.position_align = None;
        settings.position_auto = true;
    }
    settings
}

/// Offset implied by an `X-TIMESTAMP-MAP` header line, per the rule that a
/// cue's local time `t` maps to presentation time
/// `t - local + (mpegts / 90000) + period_start`.
#[derive(Debug, Clone, Copy, Default)]
struct TimestampMapOffset {
    local: f64,
    mpegts_seconds: f64,
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Parse a whole `WEBVTT`-prefixed payload into cues.
///
/// `time.segment_start` is added to every cue as a base offset (the media
/// segment's presentation start); if the payload carries an
/// `X-TIMESTAMP-MAP` header, its offset is applied in place of
/// `segment_start` as described in spec edge cases for segmented VTT.
pub fn parse_vtt(text: &str, time: ParserTime) -> Result<Vec<TextCue>, TextError> {
    let normalized = strip_bom(text).replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = normalized.lines();

    let header = lines
        .next()
        .ok_or_else(|| TextError::InvalidTextHeader("empty payload".to_string()))?;
    if !(header == "WEBVTT" || header.starts_with("WEBVTT ") || header.starts_with("WEBVTT\t")) {
        return Err(TextError::InvalidTextHeader(format!(
            "expected `WEBVTT` header, found `{header}`"
        )));
    }

    let mut timestamp_map: Option<TimestampMapOffset> = None;
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_header_block = true;

    for line in lines {
        if in_header_block {
            if line.is_empty() {
                in_header_block = false;
                continue;
            }
            if line.contains("X-TIMESTAMP-MAP") {
                let local_caps = timestamp_map_local_re().captures(line);
                let mpegts_caps = timestamp_map_mpegts_re().captures(line);
                if let (Some(local_caps), Some(mpegts_caps)) = (local_caps, mpegts_caps) {
                    let local = parse_timestamp(&local_caps["local"])?;
                    let mpegts: f64 = mpegts_caps["mpegts"]
                        .parse()
                        .map_err(|_| TextError::InvalidTextHeader("bad MPEGTS value".to_string()))?;
                    timestamp_map = Some(TimestampMapOffset {
                        local,
                        mpegts_seconds: mpegts / 90_000.0,
                    });
                }
            }
            continue;
        }
        body_lines.push(line);
    }

    let base_offset = match timestamp_map {
        Some(map) => time.period_start + map.mpegts_seconds - map.local,
        None => time.segment_start,
    };

    let mut cues = Vec::new();
    let mut idx = 0;
    while idx < body_lines.len() {
        while idx < body_lines.len() && body_lines[idx].trim().is_empty() {
            idx += 1;
        }
        if idx >= body_lines.len() {
            break;
        }

        if body_lines[idx].trim_start().starts_with("NOTE") {
            while idx < body_lines.len() && !body_lines[idx].trim().is_empty() {
                idx += 1;
            }
            continue;
        }

        let mut candidate_id = None;
        let mut timing_idx = idx;
        if !timing_line_re().is_match(body_lines[idx]) {
            candidate_id = Some(body_lines[idx].trim().to_string());
            timing_idx += 1;
        }

        let Some(timing_line) = body_lines.get(timing_idx) else {
            break;
        };
        let Some(caps) = timing_line_re().captures(timing_line) else {
            idx = timing_idx + 1;
            continue;
        };

        let start = parse_timestamp(&caps["start"])? + base_offset;
        let end = parse_timestamp(&caps["end"])? + base_offset;
        let mut settings = parse_settings(&caps["settings"]);
        settings.id = candidate_id;

        let mut payload_lines = Vec::new();
        idx = timing_idx + 1;
        while idx < body_lines.len() && !body_lines[idx].trim().is_empty() {
            payload_lines.push(body_lines[idx]);
            idx += 1;
        }

        let mut cue = TextCue::new(start, end, payload_lines.join("\n"));
        cue.settings = settings;
        cues.push(cue);
    }

    Ok(cues)
}

/// Stateless `TextParser` adapter over [`parse_vtt`], registered under
/// `text/vtt`.
#[derive(Debug, Default)]
pub struct VttParser;

#[async_trait::async_trait]
impl TextParser for VttParser {
    fn parse_media(&mut self, data: &Bytes, time: ParserTime) -> Result<Vec<TextCue>, TextError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TextError::InvalidTextCue(format!("not valid utf-8: {e}")))?;
        parse_vtt(text, time)
    }
}
