//! Offline reconstruction of trips from recorded movement events and location history.
//!
//! History is replayed through the same state machine the live engine uses. Movement events
//! are only stored on change, so a single update confirms a mode; the 30 s debounce still
//! applies because time advances with the replayed samples.

use chrono::{DateTime, Utc};

use crate::detection::DetectionConfig;
use crate::models::{LocationSample, MovementEvent, TransportationState, Trip};
use crate::settings::TripSettings;

use super::finalizer::{FinalizeOutcome, TripFinalizer};
use super::state::{Effect, EngineInput, TripStateMachine};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

fn replay_inputs(events: &[MovementEvent], locations: &[LocationSample]) -> Vec<EngineInput> {
    let mut inputs: Vec<(DateTime<Utc>, u8, EngineInput)> = events
        .iter()
        .map(|event| {
            let mut state =
                TransportationState::new(event.new_mode, event.confidence, event.timestamp);
            state.source = event.source;
            (event.timestamp, 0, EngineInput::Mode(state))
        })
        .chain(
            locations
                .iter()
                .map(|sample| (sample.timestamp, 1, EngineInput::Location(sample.clone()))),
        )
        .collect();
    // Mode before location at equal timestamps.
    inputs.sort_by_key(|(at, order, _)| (*at, *order));
    inputs.into_iter().map(|(_, _, input)| input).collect()
}

/// Replay history up to `until` and return every trip that completed, unfinalized.
pub fn reconstruct_trips(
    settings: &TripSettings,
    events: &[MovementEvent],
    locations: &[LocationSample],
    until: DateTime<Utc>,
) -> Vec<Trip> {
    let mut settings = settings.clone();
    settings.trip_detection_enabled = true;
    let mut machine = TripStateMachine::new(settings, DetectionConfig::for_replay());

    let mut effects = Vec::new();
    for input in replay_inputs(events, locations) {
        match machine.apply(input) {
            Ok(mut produced) => effects.append(&mut produced),
            Err(err) => log_warn!("backfill skipped input: {err}"),
        }
    }
    machine.advance(until, &mut effects);

    effects
        .into_iter()
        .filter_map(|effect| match effect {
            Effect::TripCompleted(trip) => Some(trip),
            _ => None,
        })
        .collect()
}

fn overlaps(trip: &Trip, other: &Trip) -> bool {
    let end = trip.end_time.unwrap_or(trip.start_time);
    let other_end = other.end_time.unwrap_or(other.updated_at);
    trip.start_time < other_end && end > other.start_time
}

/// Reconstruct, finalize and drop trips that collide with `existing` ones.
pub fn backfill_trips(
    settings: &TripSettings,
    events: &[MovementEvent],
    locations: &[LocationSample],
    until: DateTime<Utc>,
    existing: &[Trip],
) -> Vec<Trip> {
    let finalizer = TripFinalizer::from_settings(settings);
    let mut kept: Vec<Trip> = Vec::new();

    for trip in reconstruct_trips(settings, events, locations, until) {
        match finalizer.finalize(trip, kept.last()) {
            FinalizeOutcome::Persisted(trip) => kept.push(trip),
            FinalizeOutcome::Merged { merged, .. } => {
                kept.pop();
                kept.push(merged);
            }
            FinalizeOutcome::Discarded { .. } => {}
        }
    }

    let before = kept.len();
    kept.retain(|trip| !existing.iter().any(|other| overlaps(trip, other)));
    if kept.len() < before {
        log_info!(
            "backfill skipped {} trips overlapping recorded ones",
            before - kept.len()
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectionSource, TransportationMode, TripTrigger};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(from: TransportationMode, to: TransportationMode, secs: i64) -> MovementEvent {
        MovementEvent {
            id: format!("ev-{secs}"),
            timestamp: t(secs),
            trip_id: None,
            previous_mode: from,
            new_mode: to,
            source: DetectionSource::ActivityRecognition,
            confidence: 0.9,
            detection_latency_ms: 0,
            location: None,
            device_state: None,
            sensor_telemetry: None,
        }
    }

    /// One fix every 20 s, parked until 100 s, driving north at 15 m/s until 1300 s,
    /// parked afterwards.
    fn commute_locations() -> Vec<LocationSample> {
        (0..=100)
            .map(|i| {
                let secs = i * 20;
                let moving_secs = (secs.clamp(100, 1300) - 100) as f64;
                LocationSample::new(52.0 + moving_secs * 15.0 / 111_195.0, 13.0, 5.0, t(secs))
            })
            .collect()
    }

    fn commute_events() -> Vec<MovementEvent> {
        vec![
            event(TransportationMode::Unknown, TransportationMode::Stationary, 0),
            event(TransportationMode::Stationary, TransportationMode::InVehicle, 100),
            event(TransportationMode::InVehicle, TransportationMode::Stationary, 1300),
        ]
    }

    #[test]
    fn recorded_history_yields_the_trip() {
        let trips = backfill_trips(
            &TripSettings::default(),
            &commute_events(),
            &commute_locations(),
            t(2000),
            &[],
        );
        assert_eq!(trips.len(), 1);
        let trip = &trips[0];
        assert_eq!(trip.start_time, t(100));
        assert_eq!(trip.end_time, Some(t(1300)));
        assert_eq!(trip.end_trigger, Some(TripTrigger::Stationary));
        assert_eq!(trip.dominant_mode, TransportationMode::InVehicle);
        assert!(trip.total_distance_meters > 15_000.0);
    }

    #[test]
    fn trips_overlapping_recorded_ones_are_skipped() {
        let first = backfill_trips(
            &TripSettings::default(),
            &commute_events(),
            &commute_locations(),
            t(2000),
            &[],
        );
        let again = backfill_trips(
            &TripSettings::default(),
            &commute_events(),
            &commute_locations(),
            t(2000),
            &first,
        );
        assert!(again.is_empty());
    }

    #[test]
    fn open_trip_at_the_end_of_history_is_not_emitted() {
        let locations: Vec<LocationSample> = commute_locations()
            .into_iter()
            .filter(|sample| sample.timestamp < t(1000))
            .collect();
        let trips = reconstruct_trips(
            &TripSettings::default(),
            &commute_events()[..2],
            &locations,
            t(1000),
        );
        assert!(trips.is_empty());
    }
}
