//! Cue data model and the sorted interval store [`CueStore`] that backs
//! [`crate::TextEngine`].

/// Horizontal text alignment, as parsed from a VTT `align:` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueAlign {
    Start,
    Middle,
    Center,
    End,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueVertical {
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueLineAlign {
    Start,
    End,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuePositionAlign {
    LineLeft,
    LineRight,
    Center,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CueLine {
    /// `line:<percent>%` — a percentage of the video's extent.
    Percent(f64),
    /// `line:<n>` — an integer line number, possibly negative.
    Number(i32),
}

/// Optional positioning/styling settings parsed from a VTT cue's timing line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueSettings {
    pub align: Option<CueAlign>,
    pub vertical: Option<CueVertical>,
    pub size: Option<f64>,
    pub position: Option<f64>,
    /// Set by the `align:center` platform workaround, which forces
    /// position to an automatic value rather than a numeric percent.
    pub position_auto: bool,
    pub position_align: Option<CuePositionAlign>,
    pub line: Option<CueLine>,
    pub line_align: Option<CueLineAlign>,
    pub snap_to_lines: bool,
    pub id: Option<String>,
}

/// A single timed-text cue.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCue {
    pub start_time: f64,
    pub end_time: f64,
    pub payload: String,
    pub settings: CueSettings,
}

impl TextCue {
    pub fn new(start_time: f64, end_time: f64, payload: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            payload: payload.into(),
            settings: CueSettings::default(),
        }
    }

    fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start_time < end && self.end_time > start
    }
}

/// Cues sorted by `start_time`, queried and mutated the way spec §4.2/§8
/// describes: append preserves sort order, `remove` takes a half-open
/// interval, and `buffer_start`/`buffer_end`/`buffered_ahead_of` report the
/// convex span of contained cues.
#[derive(Debug, Default)]
pub struct CueStore {
    cues: Vec<TextCue>,
}

impl CueStore {
    pub fn new() -> Self {
        Self { cues: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextCue> {
        self.cues.iter()
    }

    /// Insert `cue`, maintaining ascending `start_time` order via binary
    /// search (acceptable at the expected cue-count of a timed-text track).
    pub fn insert(&mut self, cue: TextCue) {
        let idx = self
            .cues
            .partition_point(|existing| existing.start_time <= cue.start_time);
        self.cues.insert(idx, cue);
    }

    /// Remove every cue whose `[start_time, end_time)` overlaps
    /// `[start, end)`, returning the removed cues (for `removeCue` emission).
    pub fn remove(&mut self, start: f64, end: f64) -> Vec<TextCue> {
        let mut removed = Vec::new();
        self.cues.retain(|cue| {
            if cue.overlaps(start, end) {
                removed.push(cue.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn buffer_start(&self) -> Option<f64> {
        self.cues.first().map(|c| c.start_time)
    }

    pub fn buffer_end(&self) -> Option<f64> {
        self.cues
            .iter()
            .map(|c| c.end_time)
            .fold(None, |max, v| Some(max.map_or(v, |m: f64| m.max(v))))
    }

    /// `t` is considered buffered if it falls within some cue's interval;
    /// gaps between cues are ignored and the buffered range is treated as
    /// the convex span of all stored cues.
    pub fn buffered_ahead_of(&self, t: f64, append_window_end: f64) -> f64 {
        let within_some_cue = self.cues.iter().any(|c| c.start_time <= t && t < c.end_time);
        if !within_some_cue {
            return 0.0;
        }
        match self.buffer_end() {
            Some(end) => (append_window_end.min(end) - t).max(0.0),
            None => 0.0,
        }
    }

    /// Debug/test invariant check: sorted and non-crossing buffer bounds.
    pub fn is_sorted(&self) -> bool {
        self.cues.windows(2).all(|w| w[0].start_time <= w[1].start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_maintains_sort_order() {
        let mut store = CueStore::new();
        store.insert(TextCue::new(5.0, 6.0, "c"));
        store.insert(TextCue::new(1.0, 2.0, "a"));
        store.insert(TextCue::new(3.0, 4.0, "b"));
        assert!(store.is_sorted());
        let starts: Vec<f64> = store.iter().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn remove_overlapping_interval_drops_matching_cues() {
        let mut store = CueStore::new();
        store.insert(TextCue::new(0.0, 2.0, "a"));
        store.insert(TextCue::new(2.0, 4.0, "b"));
        store.insert(TextCue::new(5.0, 6.0, "c"));

        let removed = store.remove(1.0, 5.0);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().next().unwrap().payload, "c");
    }

    #[test]
    fn buffer_start_end_none_when_empty() {
        let store = CueStore::new();
        assert_eq!(store.buffer_start(), None);
        assert_eq!(store.buffer_end(), None);
    }

    #[test]
    fn buffer_start_end_reflect_min_max() {
        let mut store = CueStore::new();
        store.insert(TextCue::new(1.0, 3.0, "a"));
        store.insert(TextCue::new(2.0, 9.0, "b"));
        assert_eq!(store.buffer_start(), Some(1.0));
        assert_eq!(store.buffer_end(), Some(9.0));
    }

    #[test]
    fn buffered_ahead_of_is_zero_outside_any_cue() {
        let mut store = CueStore::new();
        store.insert(TextCue::new(1.0, 2.0, "a"));
        store.insert(TextCue::new(5.0, 6.0, "b"));
        // t=3 is in the gap between cues; ignored per convex-span rule.
        assert_eq!(store.buffered_ahead_of(3.0, 10.0), 0.0);
    }

    #[test]
    fn buffered_ahead_of_uses_append_window_end_clamp() {
        let mut store = CueStore::new();
        store.insert(TextCue::new(0.0, 10.0, "a"));
        assert_eq!(store.buffered_ahead_of(2.0, 5.0), 3.0);
    }
}
