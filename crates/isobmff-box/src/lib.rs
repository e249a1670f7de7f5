//! Minimal ISOBMFF (ISO Base Media File Format) box-header walking.
//!
//! This is just enough box parsing to locate `moof`/`traf`/`tfhd`/`trun`/`tfdt`
//! for event-message and fragment-timing extraction, and sample-entry/child
//! boxes for the embedded text-track parsers. It does not understand any
//! box's payload beyond the handful of fixed-layout fields those callers need.

use bytes::Bytes;

/// A parsed view over a single box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxView {
    pub start: usize,
    pub end: usize,
    pub size: usize,
    pub header_size: usize,
    pub fourcc: [u8; 4],
    pub body_start: usize,
    pub body_end: usize,
}

impl BoxView {
    pub fn fourcc_str(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).into_owned()
    }
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`), and
/// box-extends-to-EOF (`size == 0`).
pub fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some((ext_size as usize, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
pub fn box_at(data: &Bytes, offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }

    let remaining = &data[offset..end];
    let (size, fourcc, header_size) = read_box_header(remaining)?;

    if size < header_size || offset + size > end {
        return None;
    }

    let body_start = offset + header_size;
    let body_end = offset + size;
    Some(BoxView {
        start: offset,
        end: offset + size,
        size,
        header_size,
        fourcc,
        body_start,
        body_end,
    })
}

/// Find the first child box with the given FourCC inside `[start..end)`.
pub fn find_first_box(data: &Bytes, start: usize, end: usize, target: [u8; 4]) -> Option<BoxView> {
    let mut offset = start;
    while offset < end {
        let parsed = box_at(data, offset, end)?;
        if parsed.fourcc == target {
            return Some(parsed);
        }
        offset = parsed.end;
    }
    None
}

/// Find the first child box payload for the given FourCC inside `[start..end)`.
pub fn find_first_box_payload(data: &Bytes, start: usize, end: usize, target: [u8; 4]) -> Option<Bytes> {
    let parsed = find_first_box(data, start, end, target)?;
    Some(data.slice(parsed.body_start..parsed.body_end))
}

/// Iterate every top-level (or child, given a `start..end` sub-range) box.
pub fn iter_boxes(data: &Bytes, start: usize, end: usize) -> BoxIter<'_> {
    BoxIter {
        data,
        offset: start,
        end,
    }
}

pub struct BoxIter<'a> {
    data: &'a Bytes,
    offset: usize,
    end: usize,
}

impl Iterator for BoxIter<'_> {
    type Item = BoxView;

    fn next(&mut self) -> Option<BoxView> {
        let parsed = box_at(self.data, self.offset, self.end)?;
        self.offset = parsed.end;
        Some(parsed)
    }
}

/// Walk a chain of nested FourCCs from a root range, returning the final box's
/// body range, e.g. `find_descendant(data, 0, len, &[*b"moov", *b"trak", *b"mdia"])`.
pub fn find_descendant(
    data: &Bytes,
    start: usize,
    end: usize,
    path: &[[u8; 4]],
) -> Option<(usize, usize)> {
    let mut range = (start, end);
    for fourcc in path {
        let found = find_first_box(data, range.0, range.1, *fourcc)?;
        range = (found.body_start, found.body_end);
    }
    Some(range)
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

    #[test]
    fn reads_basic_box_header() {
        let raw = make_box(b"moov", &[1, 2, 3, 4]);
        let (size, fourcc, header_size) = read_box_header(&raw).unwrap();
        assert_eq!(size, 12);
        assert_eq!(&fourcc, b"moov");
        assert_eq!(header_size, 8);
    }

    #[test]
    fn reads_extended_64bit_size() {
        let mut raw = 1u32.to_be_bytes().to_vec();
        raw.extend_from_slice(b"mdat");
        raw.extend_from_slice(&24u64.to_be_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        let (size, fourcc, header_size) = read_box_header(&raw).unwrap();
        assert_eq!(size, 24);
        assert_eq!(&fourcc, b"mdat");
        assert_eq!(header_size, 16);
    }

    #[test]
    fn box_extending_to_eof_has_size_zero() {
        let mut raw = 0u32.to_be_bytes().to_vec();
        raw.extend_from_slice(b"mdat");
        raw.extend_from_slice(&[9, 9, 9]);
        let (size, _, header_size) = read_box_header(&raw).unwrap();
        assert_eq!(size, raw.len());
        assert_eq!(header_size, 8);
    }

    #[test]
    fn finds_first_child_box() {
        let mut raw = Vec::new();
        raw.extend(make_box(b"free", &[0, 0]));
        raw.extend(make_box(b"tfhd", &[9, 9, 9, 9]));
        let data = Bytes::from(raw);
        let found = find_first_box(&data, 0, data.len(), *b"tfhd").unwrap();
        assert_eq!(&found.fourcc, b"tfhd");
        assert_eq!(&data[found.body_start..found.body_end], &[9, 9, 9, 9]);
    }

    #[test]
    fn iterates_all_sibling_boxes() {
        let mut raw = Vec::new();
        raw.extend(make_box(b"aaaa", &[]));
        raw.extend(make_box(b"bbbb", &[1]));
        raw.extend(make_box(b"cccc", &[1, 2]));
        let data = Bytes::from(raw);
        let fourccs: Vec<String> = iter_boxes(&data, 0, data.len())
            .map(|b| b.fourcc_str())
            .collect();
        assert_eq!(fourccs, vec!["aaaa", "bbbb", "cccc"]);
    }

    #[test]
    fn find_descendant_walks_nested_path() {
        let inner = make_box(b"tkhd", &[0, 0, 0, 0]);
        let trak = make_box(b"trak", &inner);
        let moov = make_box(b"moov", &trak);
        let data = Bytes::from(moov);
        let (body_start, body_end) =
            find_descendant(&data, 0, data.len(), &[*b"moov", *b"trak", *b"tkhd"]).unwrap();
        assert_eq!(&data[body_start..body_end], &[0, 0, 0, 0]);
    }

    #[test]
    fn truncated_header_returns_none() {
        let data = Bytes::from(vec![0, 0, 0, 8, b'm']);
        assert!(box_at(&data, 0, data.len()).is_none());
    }
}
