//! `emsg` (event message) box parsing, per spec.md §4.1 "Embedded emsg
//! boxes" and the §8 scenario 6 byte layout. Built on `isobmff-box`'s
//! generic box walker, trimmed to the one fixed-layout box this crate
//! needs.

use bytes::Bytes;
use isobmff_box::iter_boxes;

use crate::error::StreamingError;
use crate::traits::EmsgEvent;

/// Scheme that signals a manifest-update event rather than an opaque
/// application event, per spec.md §4.1.
pub const MANIFEST_UPDATE_SCHEME: &str = "urn:mpeg:dash:event:2012";

fn read_cstr(data: &[u8], offset: &mut usize) -> Result<String, StreamingError> {
    let start = *offset;
    while *offset < data.len() && data[*offset] != 0 {
        *offset += 1;
    }
    if *offset >= data.len() {
        return Err(StreamingError::InvalidEmsg {
            reason: "unterminated string in emsg box".to_string(),
        });
    }
    let s = String::from_utf8_lossy(&data[start..*offset]).into_owned();
    *offset += 1; // skip NUL
    Ok(s)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, StreamingError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| StreamingError::InvalidEmsg {
            reason: "truncated emsg box".to_string(),
        })
}

/// Parsed `emsg` fields, before the `startTime`/`endTime` are resolved
/// against a segment start (which the caller supplies, since the box
/// itself only carries `presentationTimeDelta`).
struct RawEmsg {
    scheme_id_uri: String,
    value: String,
    timescale: u32,
    presentation_time_delta: u32,
    event_duration: u32,
    id: u32,
    message_data: Bytes,
}

/// Parse a single `emsg` box body (version 0 layout: the only version
/// spec.md's scenario exercises).
fn parse_emsg_body(body: &Bytes) -> Result<RawEmsg, StreamingError> {
    let data: &[u8] = body;
    if data.len() < 4 {
        return Err(StreamingError::InvalidEmsg {
            reason: "emsg box body too short for full box header".to_string(),
        });
    }
    let version = data[0];
    if version != 0 {
        return Err(StreamingError::InvalidEmsg {
            reason: format!("unsupported emsg version {version}"),
        });
    }

    let mut offset = 4usize; // skip version(1) + flags(3)
    let scheme_id_uri = read_cstr(data, &mut offset)?;
    let value = read_cstr(data, &mut offset)?;
    let timescale = read_u32(data, offset)?;
    let presentation_time_delta = read_u32(data, offset + 4)?;
    let event_duration = read_u32(data, offset + 8)?;
    let id = read_u32(data, offset + 12)?;
    let message_data = body.slice((offset + 16).min(body.len())..);

    Ok(RawEmsg {
        scheme_id_uri,
        value,
        timescale,
        presentation_time_delta,
        event_duration,
        id,
        message_data,
    })
}

/// Result of scanning a video segment for `emsg` boxes: events to surface
/// via `onEvent`, and whether any scheme `urn:mpeg:dash:event:2012` fired
/// (caller should invoke `onManifestUpdate` once, not once per box).
pub struct EmsgScanResult {
    pub events: Vec<EmsgEvent>,
    pub manifest_update: bool,
}

/// Scan top-level boxes in `segment_data` for `emsg`, computing presentation
/// `startTime`/`endTime` from `segment_start` per spec.md §4.1:
/// `start = segmentStart + presentationTimeDelta/timescale`,
/// `end = start + eventDuration/timescale`.
pub fn scan_emsg_boxes(segment_data: &Bytes, segment_start: f64) -> Result<EmsgScanResult, StreamingError> {
    let mut events = Vec::new();
    let mut manifest_update = false;

    for view in iter_boxes(segment_data, 0, segment_data.len()) {
        if &view.fourcc != b"emsg" {
            continue;
        }
        let body = segment_data.slice(view.body_start..view.body_end);
        let raw = parse_emsg_body(&body)?;

        if raw.scheme_id_uri == MANIFEST_UPDATE_SCHEME {
            manifest_update = true;
            continue;
        }

        let start_time = segment_start + raw.presentation_time_delta as f64 / raw.timescale as f64;
        let end_time = start_time + raw.event_duration as f64 / raw.timescale as f64;

        events.push(EmsgEvent {
            scheme_id_uri: raw.scheme_id_uri,
            value: raw.value,
            timescale: raw.timescale,
            presentation_time_delta: raw.presentation_time_delta,
            event_duration: raw.event_duration,
            id: raw.id,
            message_data: raw.message_data,
            start_time,
            end_time,
        });
    }

    Ok(EmsgScanResult {
        events,
        manifest_update,
    })
}
