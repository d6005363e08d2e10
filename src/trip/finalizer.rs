use chrono::Duration;
use log::{debug, info};

use crate::models::{ModeSegment, TransportationMode, Trip};
use crate::settings::TripSettings;
use crate::tracking::apply_summary;

/// What happened to a completed trip.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// Persist as-is.
    Persisted(Trip),
    /// Folded into the preceding trip, which keeps its id. `absorbed_id` is never persisted.
    Merged { merged: Trip, absorbed_id: String },
    Discarded { trip: Trip, reason: DiscardReason },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscardReason {
    TooShort { duration_ms: u64 },
    TooClose { distance_meters: f64 },
}

impl DiscardReason {
    pub fn describe(&self) -> String {
        match self {
            DiscardReason::TooShort { duration_ms } => {
                format!("duration {} s below minimum", duration_ms / 1000)
            }
            DiscardReason::TooClose { distance_meters } => {
                format!("distance {distance_meters:.0} m below minimum")
            }
        }
    }
}

/// Applies minimum duration/distance and auto-merge to completed trips.
#[derive(Debug, Clone)]
pub struct TripFinalizer {
    minimum_distance_meters: f64,
    minimum_duration: Duration,
    auto_merge_enabled: bool,
    merge_window: Duration,
}

impl TripFinalizer {
    pub fn from_settings(settings: &TripSettings) -> Self {
        Self {
            minimum_distance_meters: settings.minimum_distance_meters,
            minimum_duration: settings.minimum_duration(),
            auto_merge_enabled: settings.auto_merge_enabled,
            merge_window: settings.merge_window(),
        }
    }

    /// `previous` must be the most recent persisted COMPLETED trip, if any.
    ///
    /// Merge is attempted first so a short tail after a stop is folded into the trip before
    /// it rather than dropped.
    pub fn finalize(&self, trip: Trip, previous: Option<&Trip>) -> FinalizeOutcome {
        if let Some(previous) = previous.filter(|previous| self.can_merge(previous, &trip)) {
            let absorbed_id = trip.id.clone();
            let merged = merge(previous, &trip);
            info!(
                "Merged trip {} into {} ({:.0} m total)",
                absorbed_id, merged.id, merged.total_distance_meters
            );
            return FinalizeOutcome::Merged {
                merged,
                absorbed_id,
            };
        }

        let duration_ms = trip.duration_ms().unwrap_or(0);
        if trip.total_distance_meters < self.minimum_distance_meters {
            let reason = DiscardReason::TooClose {
                distance_meters: trip.total_distance_meters,
            };
            info!("Discarding trip {}: {}", trip.id, reason.describe());
            return FinalizeOutcome::Discarded { trip, reason };
        }
        if (duration_ms as i64) < self.minimum_duration.num_milliseconds() {
            let reason = DiscardReason::TooShort { duration_ms };
            info!("Discarding trip {}: {}", trip.id, reason.describe());
            return FinalizeOutcome::Discarded { trip, reason };
        }

        FinalizeOutcome::Persisted(trip)
    }

    fn can_merge(&self, previous: &Trip, trip: &Trip) -> bool {
        if !self.auto_merge_enabled || previous.id == trip.id {
            return false;
        }
        let Some(previous_end) = previous.end_time else {
            return false;
        };
        if previous_end > trip.start_time {
            debug!(
                "Not merging {} into {}: intervals overlap",
                trip.id, previous.id
            );
            return false;
        }
        trip.start_time - previous_end <= self.merge_window
    }
}

/// Concatenate `later` onto `earlier`. The gap between them becomes a STATIONARY segment so
/// the breakdown keeps summing to the merged duration.
pub fn merge(earlier: &Trip, later: &Trip) -> Trip {
    let earlier_end = earlier.end_time.unwrap_or(later.start_time);

    let mut segments = earlier.segments.clone();
    if later.start_time > earlier_end {
        segments.push(ModeSegment {
            mode: TransportationMode::Stationary,
            start_time: earlier_end,
            end_time: later.start_time,
        });
    }
    segments.extend(later.segments.iter().cloned());

    let mut merged = earlier.clone();
    merged.segments = coalesce(segments);
    merged.end_time = later.end_time;
    merged.end_location = later.end_location.clone();
    merged.end_trigger = later.end_trigger;
    merged.state = later.state;
    merged.total_distance_meters = earlier.total_distance_meters + later.total_distance_meters;
    merged.location_count = earlier.location_count + later.location_count;
    merged.synced = false;
    merged.updated_at = later.updated_at.max(earlier.updated_at);
    apply_summary(&mut merged);
    merged
}

/// Join neighbouring segments that carry the same mode.
fn coalesce(segments: Vec<ModeSegment>) -> Vec<ModeSegment> {
    let mut result: Vec<ModeSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match result.last_mut() {
            Some(last) if last.mode == segment.mode && last.end_time >= segment.start_time => {
                last.end_time = last.end_time.max(segment.end_time);
            }
            _ => result.push(segment),
        }
    }
    result
}
