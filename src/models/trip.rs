//! Trip and mode-segment models.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LocationSample, TransportationMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripState {
    Idle,
    Active,
    PendingEnd,
    Completed,
}

impl TripState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripState::Idle => "IDLE",
            TripState::Active => "ACTIVE",
            TripState::PendingEnd => "PENDING_END",
            TripState::Completed => "COMPLETED",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TripState::Active | TripState::PendingEnd)
    }
}

impl Default for TripState {
    fn default() -> Self {
        TripState::Idle
    }
}

/// Why a trip started or ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripTrigger {
    ModeChange,
    Distance,
    Time,
    Stationary,
    Manual,
}

impl TripTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripTrigger::ModeChange => "MODE_CHANGE",
            TripTrigger::Distance => "DISTANCE",
            TripTrigger::Time => "TIME",
            TripTrigger::Stationary => "STATIONARY",
            TripTrigger::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModeSegment {
    pub mode: TransportationMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ModeSegment {
    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub state: TripState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_location: Option<LocationSample>,
    pub end_location: Option<LocationSample>,
    pub total_distance_meters: f64,
    pub location_count: u64,
    pub dominant_mode: TransportationMode,
    pub modes_used: BTreeSet<TransportationMode>,
    pub mode_breakdown: BTreeMap<TransportationMode, u64>,
    pub start_trigger: TripTrigger,
    pub end_trigger: Option<TripTrigger>,
    /// Closed segments, oldest first. Breakdown and dominant mode are derived from these.
    #[serde(default)]
    pub segments: Vec<ModeSegment>,
    #[serde(default)]
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }

    /// Mode of the segment covering `at`, falling back to the dominant mode.
    pub fn mode_at(&self, at: DateTime<Utc>) -> TransportationMode {
        self.segments
            .iter()
            .find(|segment| segment.start_time <= at && at < segment.end_time)
            .or_else(|| self.segments.last().filter(|segment| segment.end_time == at))
            .map(|segment| segment.mode)
            .unwrap_or(self.dominant_mode)
    }
}

/// A completed trip together with its raw and map-matched locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripWithLocations {
    pub trip: Trip,
    pub locations: Vec<LocationSample>,
    pub matched_points: Vec<crate::matching::MatchedPoint>,
}
