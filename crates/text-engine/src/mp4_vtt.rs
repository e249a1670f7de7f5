//! MP4-embedded WebVTT (`wvtt`) parser.
//!
//! Stateful: `parse_init` records the track timescale out of the init
//! segment's `moov/trak/mdia/mdhd`, and every subsequent `parse_media` call
//! walks one fragment's `moof`/`mdat` pair, turning each `trun` sample into a
//! `vttc` (cue) or `vtte` (empty cue) box read out of `mdat` in sample order.

use bytes::Bytes;
use isobmff_box::{find_first_box_payload, iter_boxes};

use crate::cue::TextCue;
use crate::error::TextError;
use crate::fragment::{fragment_samples, init_segment_timescale, validate_sample_entry};
use crate::parser::{ParserTime, TextParser};

const DEFAULT_TIMESCALE: u32 = 1000;

/// Read the `iden`/`payl` text children out of a single `vttc` cue box body.
fn parse_vttc_body(data: &Bytes, body_start: usize, body_end: usize) -> (Option<String>, String) {
    let iden = find_first_box_payload(data, body_start, body_end, *b"iden")
        .map(|b| String::from_utf8_lossy(&b).into_owned());
    let payl = find_first_box_payload(data, body_start, body_end, *b"payl")
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    (iden, payl)
}

#[derive(Debug, Default)]
pub struct Mp4VttParser {
    timescale: Option<u32>,
}

impl Mp4VttParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn timescale(&self) -> u32 {
        self.timescale.unwrap_or(DEFAULT_TIMESCALE)
    }
}

#[async_trait::async_trait]
impl TextParser for Mp4VttParser {
    fn parse_init(&mut self, data: &Bytes) -> Result<(), TextError> {
        validate_sample_entry(data, b"wvtt", TextError::InvalidMp4Vtt)?;
        self.timescale = Some(init_segment_timescale(data, TextError::InvalidMp4Vtt)?);
        Ok(())
    }

    fn parse_media(&mut self, data: &Bytes, time: ParserTime) -> Result<Vec<TextCue>, TextError> {
        // Unlike standalone VTT (offset by `segment_start`), `tfdt` in an
        // ISOBMFF fragment already carries a period-relative decode time, so
        // presentation time is `period_start + tfdt/timescale + ...` per
        // spec.md §4.3.
        let samples = fragment_samples(data, self.timescale(), time.period_start)?;

        let mut cues = Vec::with_capacity(samples.len());
        for sample in samples {
            let Some(cue_box) = iter_boxes(data, sample.body_start, sample.body_end)
                .find(|b| b.fourcc == *b"vttc" || b.fourcc == *b"vtte")
            else {
                continue;
            };
            if cue_box.fourcc != *b"vttc" {
                continue;
            }
            let (id, payload) = parse_vttc_body(data, cue_box.body_start, cue_box.body_end);
            let mut cue = TextCue::new(sample.start, sample.end, payload);
            cue.settings.id = id;
            cues.push(cue);
        }
        Ok(cues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let size = (8 + body.len()) as u32;
        let mut out = size.to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    fn make_sample_entry_stsd(fourcc: &[u8; 4]) -> Vec<u8> {
        let sample_entry = make_box(fourcc, &[0u8; 8]);
        let mut stsd_body = vec![0u8, 0, 0, 0];
        stsd_body.extend_from_slice(&1u32.to_be_bytes());
        stsd_body.extend(sample_entry);
        make_box(b"stsd", &stsd_body)
    }

    fn make_init_segment_with_entry(timescale: u32, fourcc: &[u8; 4]) -> Bytes {
        let mut mdhd = vec![0u8, 0, 0, 0];
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&timescale.to_be_bytes());
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        let mdhd_box = make_box(b"mdhd", &mdhd);

        let stsd = make_sample_entry_stsd(fourcc);
        let stbl = make_box(b"stbl", &stsd);
        let minf = make_box(b"minf", &stbl);

        let mut mdia_body = Vec::new();
        mdia_body.extend(mdhd_box);
        mdia_body.extend(minf);
        let mdia = make_box(b"mdia", &mdia_body);

        let trak = make_box(b"trak", &mdia);
        let moov = make_box(b"moov", &trak);
        Bytes::from(moov)
    }

    fn make_init_segment(timescale: u32) -> Bytes {
        make_init_segment_with_entry(timescale, b"wvtt")
    }

    fn make_vttc(payload: &str) -> Vec<u8> {
        let payl = make_box(b"payl", payload.as_bytes());
        make_box(b"vttc", &payl)
    }

    fn make_media_segment(samples: &[(u32, &str)]) -> Bytes {
        let mut trun_body = vec![0u8, 0, 0, 0];
        let flags = 0x0000_0100u32 | 0x0000_0200u32;
        trun_body[0..4].copy_from_slice(&flags.to_be_bytes());
        trun_body.extend_from_slice(&(samples.len() as u32).to_be_bytes());

        let mut mdat_body = Vec::new();
        for (duration, text) in samples {
            let cue = make_vttc(text);
            trun_body.extend_from_slice(&duration.to_be_bytes());
            trun_body.extend_from_slice(&(cue.len() as u32).to_be_bytes());
            mdat_body.extend_from_slice(&cue);
        }

        let trun = make_box(b"trun", &trun_body);
        let mut tfdt_body = vec![0u8, 0, 0, 0];
        tfdt_body.extend_from_slice(&0u32.to_be_bytes());
        let tfdt = make_box(b"tfdt", &tfdt_body);

        let mut tfhd_body = vec![0u8, 0, 0, 0];
        tfhd_body.extend_from_slice(&1u32.to_be_bytes());
        let tfhd = make_box(b"tfhd", &tfhd_body);

        let mut traf_body = Vec::new();
        traf_body.extend(tfhd);
        traf_body.extend(tfdt);
        traf_body.extend(trun);
        let traf = make_box(b"traf", &traf_body);
        let moof = make_box(b"moof", &traf);
        let mdat = make_box(b"mdat", &mdat_body);

        let mut out = Vec::new();
        out.extend(moof);
        out.extend(mdat);
        Bytes::from(out)
    }

    #[test]
    fn parse_init_reads_timescale() {
        let mut parser = Mp4VttParser::new();
        parser.parse_init(&make_init_segment(90_000)).unwrap();
        assert_eq!(parser.timescale(), 90_000);
    }

    #[test]
    fn parse_init_rejects_wrong_sample_entry() {
        let mut parser = Mp4VttParser::new();
        let segment = make_init_segment_with_entry(90_000, b"stpp");
        let err = parser.parse_init(&segment).unwrap_err();
        assert!(matches!(err, TextError::InvalidMp4Vtt(_)));
    }

    #[test]
    fn parse_media_without_init_uses_default_timescale() {
        let mut parser = Mp4VttParser::new();
        let segment = make_media_segment(&[(1000, "hello")]);
        let cues = parser.parse_media(&segment, ParserTime::default()).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].payload, "hello");
        assert_eq!(cues[0].start_time, 0.0);
        assert_eq!(cues[0].end_time, 1.0);
    }

    #[test]
    fn parse_media_advances_decode_time_across_samples() {
        let mut parser = Mp4VttParser::new();
        parser.parse_init(&make_init_segment(1000)).unwrap();
        let segment = make_media_segment(&[(1000, "first"), (2000, "second")]);
        let cues = parser
            .parse_media(&segment, ParserTime { segment_start: 0.0, period_start: 5.0 })
            .unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start_time, 5.0);
        assert_eq!(cues[0].end_time, 6.0);
        assert_eq!(cues[1].start_time, 6.0);
        assert_eq!(cues[1].end_time, 8.0);
    }
}
