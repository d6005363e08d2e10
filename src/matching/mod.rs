//! Hand-off of completed trips to an external map matcher.
//!
//! Matching runs in the background after a trip is persisted and never delays finalization.
//! Failures are logged and otherwise ignored; the raw location history stays authoritative.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::models::{LocationSample, TransportationMode, Trip};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// A raw point tagged with the mode that was active when it was recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapMatchPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
    pub mode: TransportationMode,
    /// Upper bound the matcher may assume between consecutive points.
    pub max_speed_kmh: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapMatchRequest {
    pub trip_id: String,
    pub points: Vec<MapMatchPoint>,
}

/// A corrected point returned by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub mode: TransportationMode,
}

/// External matching backend. Called from a blocking worker thread.
pub trait MapMatcher: Send + Sync {
    fn match_trip(&self, request: &MapMatchRequest) -> Result<Vec<MatchedPoint>>;
}

/// Build the matcher input for `trip` from its recorded samples.
///
/// Samples outside the trip interval are dropped; stationary stretches keep their points but
/// carry no speed bound.
pub fn build_request(trip: &Trip, locations: &[LocationSample]) -> MapMatchRequest {
    let end = trip.end_time.unwrap_or(trip.updated_at);
    let points = locations
        .iter()
        .filter(|sample| sample.timestamp >= trip.start_time && sample.timestamp <= end)
        .map(|sample| {
            let mode = trip.mode_at(sample.timestamp);
            MapMatchPoint {
                latitude: sample.latitude,
                longitude: sample.longitude,
                accuracy: sample.accuracy,
                timestamp: sample.timestamp,
                mode,
                max_speed_kmh: mode.max_plausible_speed_kmh(),
            }
        })
        .collect();

    MapMatchRequest {
        trip_id: trip.id.clone(),
        points,
    }
}

/// Match `trip` in the background and store the result in `matched_points`.
pub fn spawn_map_matching(
    db: Database,
    matcher: Arc<dyn MapMatcher>,
    trip: Trip,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run_map_matching(&db, matcher, &trip).await {
            Ok(0) => {}
            Ok(count) => log_info!("Stored {} matched points for trip {}", count, trip.id),
            Err(err) => log_warn!("map matching failed for trip {}: {err:?}", trip.id),
        }
    })
}

async fn run_map_matching(
    db: &Database,
    matcher: Arc<dyn MapMatcher>,
    trip: &Trip,
) -> Result<usize> {
    let end = trip.end_time.unwrap_or(trip.updated_at);
    let locations = db
        .get_locations_in_range(trip.start_time, end)
        .await
        .context("failed to load trip locations")?;

    let request = build_request(trip, &locations);
    if request.points.len() < 2 {
        return Ok(0);
    }

    let matched = tokio::task::spawn_blocking(move || matcher.match_trip(&request))
        .await
        .context("map matching worker join failed")??;

    db.replace_matched_points(&trip.id, &matched)
        .await
        .context("failed to store matched points")?;
    Ok(matched.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModeSegment, TripState, TripTrigger};
    use crate::tracking::apply_summary;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn walk_then_drive() -> Trip {
        let mut trip = Trip {
            id: "trip-1".into(),
            state: TripState::Completed,
            start_time: t(0),
            end_time: Some(t(600)),
            start_location: None,
            end_location: None,
            total_distance_meters: 4_000.0,
            location_count: 4,
            dominant_mode: TransportationMode::Unknown,
            modes_used: Default::default(),
            mode_breakdown: Default::default(),
            start_trigger: TripTrigger::ModeChange,
            end_trigger: Some(TripTrigger::Stationary),
            segments: vec![
                ModeSegment {
                    mode: TransportationMode::Walking,
                    start_time: t(0),
                    end_time: t(120),
                },
                ModeSegment {
                    mode: TransportationMode::InVehicle,
                    start_time: t(120),
                    end_time: t(600),
                },
            ],
            synced: false,
            created_at: t(0),
            updated_at: t(600),
        };
        apply_summary(&mut trip);
        trip
    }

    fn samples() -> Vec<LocationSample> {
        [-30, 60, 300, 590, 700]
            .into_iter()
            .enumerate()
            .map(|(i, secs)| LocationSample::new(52.0 + i as f64 * 0.001, 13.0, 5.0, t(secs)))
            .collect()
    }

    struct Echo;

    impl MapMatcher for Echo {
        fn match_trip(&self, request: &MapMatchRequest) -> Result<Vec<MatchedPoint>> {
            Ok(request
                .points
                .iter()
                .map(|point| MatchedPoint {
                    latitude: point.latitude + 0.00001,
                    longitude: point.longitude,
                    timestamp: point.timestamp,
                    mode: point.mode,
                })
                .collect())
        }
    }

    struct Broken;

    impl MapMatcher for Broken {
        fn match_trip(&self, _request: &MapMatchRequest) -> Result<Vec<MatchedPoint>> {
            anyhow::bail!("backend unavailable")
        }
    }

    #[test]
    fn points_are_tagged_with_the_covering_mode_and_speed_bound() {
        let request = build_request(&walk_then_drive(), &samples());
        assert_eq!(request.points.len(), 3);
        assert_eq!(request.points[0].mode, TransportationMode::Walking);
        assert_eq!(request.points[0].max_speed_kmh, Some(7.0));
        assert_eq!(request.points[1].mode, TransportationMode::InVehicle);
        assert_eq!(request.points[2].max_speed_kmh, Some(150.0));
    }

    #[tokio::test]
    async fn matched_points_are_stored_for_the_trip() {
        let db = Database::in_memory().unwrap();
        let trip = walk_then_drive();
        db.upsert_trip(&trip).await.unwrap();
        db.insert_locations(&samples(), None).await.unwrap();

        spawn_map_matching(db.clone(), Arc::new(Echo), trip.clone())
            .await
            .unwrap();

        let stored = db.get_matched_points(&trip.id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].mode, TransportationMode::Walking);
    }

    #[tokio::test]
    async fn matcher_failure_is_contained() {
        let db = Database::in_memory().unwrap();
        let trip = walk_then_drive();
        db.upsert_trip(&trip).await.unwrap();
        db.insert_locations(&samples(), None).await.unwrap();

        spawn_map_matching(db.clone(), Arc::new(Broken), trip.clone())
            .await
            .unwrap();
        assert!(db.get_matched_points(&trip.id).await.unwrap().is_empty());
        assert!(db.get_trip_by_id(&trip.id).await.unwrap().is_some());
    }
}
