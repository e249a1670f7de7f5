//! Shared `moof`/`traf`/`tfhd`/`tfdt`/`trun`/`mdat` walking for the
//! MP4-embedded cue parsers (`mp4_vtt`, `mp4_ttml`). Both formats store one
//! cue per `trun` sample; they differ only in how they interpret each
//! sample's raw bytes.

use bytes::Bytes;
use isobmff_box::{find_first_box, find_first_box_payload};

use crate::error::TextError;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackFragmentHeader {
    default_sample_duration: Option<u32>,
    default_sample_size: Option<u32>,
}

fn parse_tfhd(body: &[u8]) -> TrackFragmentHeader {
    let mut out = TrackFragmentHeader::default();
    let Some(flags_bytes) = body.get(0..4) else {
        return out;
    };
    let flags = u32::from_be_bytes([0, flags_bytes[1], flags_bytes[2], flags_bytes[3]]);
    let mut offset = 4 + 4;
    if flags & 0x0000_0001 != 0 {
        offset += 8;
    }
    if flags & 0x0000_0002 != 0 {
        offset += 4;
    }
    if flags & 0x0000_0008 != 0 {
        out.default_sample_duration = read_u32(body, offset);
        offset += 4;
    }
    if flags & 0x0000_0010 != 0 {
        out.default_sample_size = read_u32(body, offset);
    }
    out
}

fn parse_tfdt(body: &[u8]) -> Option<u64> {
    let version = *body.first()?;
    if version == 1 {
        read_u64(body, 4)
    } else {
        read_u32(body, 4).map(u64::from)
    }
}

struct TrunSample {
    duration: Option<u32>,
    size: Option<u32>,
}

fn parse_trun(body: &[u8]) -> Result<Vec<TrunSample>, TextError> {
    let flags_bytes = body
        .get(0..4)
        .ok_or_else(|| TextError::InvalidMp4Vtt("truncated trun header".to_string()))?;
    let flags = u32::from_be_bytes([0, flags_bytes[1], flags_bytes[2], flags_bytes[3]]);
    let sample_count = read_u32(body, 4)
        .ok_or_else(|| TextError::InvalidMp4Vtt("truncated trun sample_count".to_string()))?;

    let mut offset = 8;
    if flags & 0x0000_0001 != 0 {
        offset += 4;
    }
    if flags & 0x0000_0004 != 0 {
        offset += 4;
    }

    let has_duration = flags & 0x0000_0100 != 0;
    let has_size = flags & 0x0000_0200 != 0;
    let has_flags = flags & 0x0000_0400 != 0;
    let has_cto = flags & 0x0000_0800 != 0;

    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let duration = if has_duration {
            let v = read_u32(body, offset)
                .ok_or_else(|| TextError::InvalidMp4Vtt("truncated trun sample duration".to_string()))?;
            offset += 4;
            Some(v)
        } else {
            None
        };
        let size = if has_size {
            let v = read_u32(body, offset)
                .ok_or_else(|| TextError::InvalidMp4Vtt("truncated trun sample size".to_string()))?;
            offset += 4;
            Some(v)
        } else {
            None
        };
        if has_flags {
            offset += 4;
        }
        if has_cto {
            offset += 4;
        }
        samples.push(TrunSample { duration, size });
    }
    Ok(samples)
}

/// One `trun` sample resolved to a presentation-time interval and its raw
/// byte range inside `mdat`.
pub struct FragmentSample {
    pub start: f64,
    pub end: f64,
    pub body_start: usize,
    pub body_end: usize,
}

/// Walk a fragment's `moof`/`mdat` pair and resolve every `trun` sample to a
/// presentation-time interval (seconds, relative to `base_offset` — callers
/// pass `period_start` since `tfdt` is a period-relative decode time) and
/// byte range. `timescale` is the track timescale taken from the init
/// segment's `mdhd`.
pub fn fragment_samples(
    data: &Bytes,
    timescale: u32,
    base_offset: f64,
) -> Result<Vec<FragmentSample>, TextError> {
    let len = data.len();
    let timescale = timescale as f64;

    let moof = find_first_box(data, 0, len, *b"moof")
        .ok_or_else(|| TextError::InvalidMp4Vtt("missing moof".to_string()))?;
    let traf = find_first_box(data, moof.body_start, moof.body_end, *b"traf")
        .ok_or_else(|| TextError::InvalidMp4Vtt("missing traf".to_string()))?;

    let tfhd = find_first_box_payload(data, traf.body_start, traf.body_end, *b"tfhd")
        .map(|b| parse_tfhd(&b))
        .unwrap_or_default();
    let base_time = find_first_box_payload(data, traf.body_start, traf.body_end, *b"tfdt")
        .and_then(|b| parse_tfdt(&b))
        .unwrap_or(0);
    let trun_body = find_first_box_payload(data, traf.body_start, traf.body_end, *b"trun")
        .ok_or_else(|| TextError::InvalidMp4Vtt("missing trun".to_string()))?;
    let samples = parse_trun(&trun_body)?;

    let mdat = find_first_box(data, 0, len, *b"mdat")
        .ok_or_else(|| TextError::InvalidMp4Vtt("missing mdat".to_string()))?;

    let mut out = Vec::with_capacity(samples.len());
    let mut decode_time = base_time;
    let mut offset = mdat.body_start;

    for sample in samples {
        let duration = sample
            .duration
            .or(tfhd.default_sample_duration)
            .ok_or_else(|| TextError::InvalidMp4Vtt("sample missing duration".to_string()))?;
        let size = sample
            .size
            .or(tfhd.default_sample_size)
            .ok_or_else(|| TextError::InvalidMp4Vtt("sample missing size".to_string()))? as usize;

        let sample_end = offset + size;
        if sample_end > mdat.body_end {
            return Err(TextError::InvalidMp4Vtt("sample overruns mdat".to_string()));
        }

        let start = base_offset + decode_time as f64 / timescale;
        let end = base_offset + (decode_time + duration as u64) as f64 / timescale;
        out.push(FragmentSample {
            start,
            end,
            body_start: offset,
            body_end: sample_end,
        });

        decode_time += duration as u64;
        offset = sample_end;
    }

    Ok(out)
}

fn parse_mdhd_timescale(body: &[u8]) -> Option<u32> {
    let version = *body.first()?;
    let timescale_offset = if version == 1 { 4 + 8 + 8 } else { 4 + 4 + 4 };
    read_u32(body, timescale_offset)
}

/// The sample-entry FourCC nested under `moov/trak/mdia/minf/stbl/stsd`,
/// i.e. the track's codec/format box — `wvtt` or `stpp` for the two
/// embedded text formats this crate supports.
fn parse_stsd_first_entry_fourcc(body: &[u8]) -> Option<[u8; 4]> {
    // `stsd` is a full box (version+flags, 4 bytes) followed by an
    // entry_count (4 bytes) and then each sample entry, which itself opens
    // with a regular box header (size + fourcc).
    let entry_header = body.get(8..16)?;
    let mut fourcc = [0u8; 4];
    fourcc.copy_from_slice(&entry_header[4..8]);
    Some(fourcc)
}

/// Validate that an init segment's sample entry matches `expected`
/// (`wvtt` or `stpp`), per spec.md §4.3's `parseInit` contract: "missing →
/// fail `INVALID_MP4_VTT` / `INVALID_MP4_TTML`". `err` builds the
/// format-specific error variant so both callers share this walk.
pub fn validate_sample_entry(
    data: &Bytes,
    expected: &[u8; 4],
    err: impl Fn(String) -> TextError,
) -> Result<(), TextError> {
    let len = data.len();
    let (stsd_start, stsd_end) = isobmff_box::find_descendant(
        data,
        0,
        len,
        &[*b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"stsd"],
    )
    .ok_or_else(|| err("missing moov/trak/mdia/minf/stbl/stsd".to_string()))?;

    let fourcc = parse_stsd_first_entry_fourcc(&data[stsd_start..stsd_end])
        .ok_or_else(|| err("truncated stsd".to_string()))?;
    if &fourcc != expected {
        return Err(err(format!(
            "expected `{}` sample entry, found `{}`",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&fourcc)
        )));
    }
    Ok(())
}

/// Read the track timescale out of an init segment's `moov/trak/mdia/mdhd`.
/// `err` builds the format-specific error variant (`INVALID_MP4_VTT` vs.
/// `INVALID_MP4_TTML`) for a missing/truncated box.
pub fn init_segment_timescale(data: &Bytes, err: impl Fn(String) -> TextError) -> Result<u32, TextError> {
    let len = data.len();
    let (mdhd_start, mdhd_end) =
        isobmff_box::find_descendant(data, 0, len, &[*b"moov", *b"trak", *b"mdia", *b"mdhd"])
            .ok_or_else(|| err("missing moov/trak/mdia/mdhd".to_string()))?;
    parse_mdhd_timescale(&data[mdhd_start..mdhd_end]).ok_or_else(|| err("truncated mdhd".to_string()))
}
