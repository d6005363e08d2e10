use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ModeSegment, TransportationMode, Trip};

/// Contiguous mode intervals for the open trip.
///
/// Only the closed segments are stored; the current one is an open `(mode, start)` pair.
/// Consecutive segments always share a boundary and never carry the same mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModeSegmentTracker {
    closed: Vec<ModeSegment>,
    current_mode: TransportationMode,
    current_start: DateTime<Utc>,
}

impl ModeSegmentTracker {
    pub fn new(mode: TransportationMode, start: DateTime<Utc>) -> Self {
        Self {
            closed: Vec::new(),
            current_mode: mode,
            current_start: start,
        }
    }

    pub fn current_mode(&self) -> TransportationMode {
        self.current_mode
    }

    pub fn current_start(&self) -> DateTime<Utc> {
        self.current_start
    }

    pub fn closed(&self) -> &[ModeSegment] {
        &self.closed
    }

    /// Close the current segment at `at` and open one for `mode`.
    ///
    /// `at` never moves a boundary backwards past the current segment's start. Returns
    /// `false` when `mode` is already the current mode.
    pub fn transition(&mut self, mode: TransportationMode, at: DateTime<Utc>) -> bool {
        if mode == self.current_mode {
            return false;
        }

        let at = at.max(self.current_start);
        if at > self.current_start {
            self.closed.push(ModeSegment {
                mode: self.current_mode,
                start_time: self.current_start,
                end_time: at,
            });
        } else if self.closed.last().map(|segment| segment.mode) == Some(mode) {
            // Zero-length segment in between: resume the previous one instead.
            if let Some(previous) = self.closed.pop() {
                self.current_mode = mode;
                self.current_start = previous.start_time;
                return true;
            }
        }

        self.current_mode = mode;
        self.current_start = at;
        true
    }

    /// Segments as of `now`, with the current one truncated at `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<ModeSegment> {
        let mut segments = self.closed.clone();
        if now > self.current_start || segments.is_empty() {
            segments.push(ModeSegment {
                mode: self.current_mode,
                start_time: self.current_start,
                end_time: now.max(self.current_start),
            });
        }
        segments
    }

    /// Close the final segment at `end` and hand back the full list.
    pub fn finish(self, end: DateTime<Utc>) -> Vec<ModeSegment> {
        self.snapshot(end)
    }
}

/// Per-mode aggregates derived from a closed segment list.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeSummary {
    pub breakdown: BTreeMap<TransportationMode, u64>,
    pub modes_used: BTreeSet<TransportationMode>,
    pub dominant: TransportationMode,
}

/// Aggregate durations per mode. The dominant mode is the one with the largest total;
/// on an exact tie the mode that appears first in `segments` wins.
pub fn summarize(segments: &[ModeSegment]) -> ModeSummary {
    let mut breakdown: BTreeMap<TransportationMode, u64> = BTreeMap::new();
    let mut first_seen: Vec<TransportationMode> = Vec::new();

    for segment in segments {
        *breakdown.entry(segment.mode).or_insert(0) += segment.duration_ms();
        if !first_seen.contains(&segment.mode) {
            first_seen.push(segment.mode);
        }
    }

    let mut dominant = first_seen
        .first()
        .copied()
        .unwrap_or(TransportationMode::Unknown);
    let mut best = breakdown.get(&dominant).copied().unwrap_or(0);
    for mode in first_seen.iter().skip(1) {
        let total = breakdown.get(mode).copied().unwrap_or(0);
        if total > best {
            best = total;
            dominant = *mode;
        }
    }

    ModeSummary {
        modes_used: breakdown.keys().copied().collect(),
        breakdown,
        dominant,
    }
}

/// Recompute a trip's derived mode fields from its segments.
pub fn apply_summary(trip: &mut Trip) {
    let summary = summarize(&trip.segments);
    trip.mode_breakdown = summary.breakdown;
    trip.modes_used = summary.modes_used;
    trip.dominant_mode = summary.dominant;
}
