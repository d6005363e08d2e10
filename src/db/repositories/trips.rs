use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Params, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, from_json, from_optional_json, parse_datetime, parse_mode,
        parse_optional_datetime, parse_trigger, parse_trip_state, to_i64, to_json,
        to_optional_json, to_u64,
    },
};
use crate::models::{ModeSegment, TransportationMode, Trip, TripWithLocations};

const TRIP_COLUMNS: &str = "id, state, start_time, end_time, start_location, end_location,
    total_distance_meters, location_count, dominant_mode, mode_breakdown, start_trigger,
    end_trigger, synced, created_at, updated_at";

fn row_to_trip(row: &Row) -> Result<Trip> {
    let breakdown_raw: String = row.get("mode_breakdown")?;
    let mode_breakdown: BTreeMap<TransportationMode, u64> =
        from_json(&breakdown_raw, "mode_breakdown")?;

    Ok(Trip {
        id: row.get("id")?,
        state: parse_trip_state(&row.get::<_, String>("state")?)?,
        start_time: parse_datetime(&row.get::<_, String>("start_time")?, "start_time")?,
        end_time: parse_optional_datetime(row.get("end_time")?, "end_time")?,
        start_location: from_optional_json(row.get("start_location")?, "start_location")?,
        end_location: from_optional_json(row.get("end_location")?, "end_location")?,
        total_distance_meters: row.get("total_distance_meters")?,
        location_count: to_u64(row.get("location_count")?, "location_count")?,
        dominant_mode: parse_mode(&row.get::<_, String>("dominant_mode")?)?,
        modes_used: mode_breakdown.keys().copied().collect(),
        mode_breakdown,
        start_trigger: parse_trigger(&row.get::<_, String>("start_trigger")?)?,
        end_trigger: row
            .get::<_, Option<String>>("end_trigger")?
            .map(|raw| parse_trigger(&raw))
            .transpose()?,
        segments: Vec::new(),
        synced: row.get::<_, i64>("synced")? != 0,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?, "created_at")?,
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?, "updated_at")?,
    })
}

fn load_segments(conn: &Connection, trip_id: &str) -> Result<Vec<ModeSegment>> {
    let mut stmt = conn.prepare(
        "SELECT mode, start_time, end_time
         FROM mode_segments
         WHERE trip_id = ?1
         ORDER BY seq ASC",
    )?;
    let mut rows = stmt.query(params![trip_id])?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(ModeSegment {
            mode: parse_mode(&row.get::<_, String>(0)?)?,
            start_time: parse_datetime(&row.get::<_, String>(1)?, "segment start_time")?,
            end_time: parse_datetime(&row.get::<_, String>(2)?, "segment end_time")?,
        });
    }
    Ok(segments)
}

fn select_trips<P: Params>(conn: &Connection, tail: &str, params: P) -> Result<Vec<Trip>> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips {tail}");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    let mut trips = Vec::new();
    while let Some(row) = rows.next()? {
        trips.push(row_to_trip(row)?);
    }
    drop(rows);

    for trip in trips.iter_mut() {
        trip.segments = load_segments(conn, &trip.id)?;
    }
    Ok(trips)
}

impl Database {
    /// Insert or replace a trip together with its segments. Saving the same trip twice
    /// leaves one row.
    pub async fn upsert_trip(&self, trip: &Trip) -> Result<()> {
        let record = trip.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO trips (
                    id, state, start_time, end_time, start_location, end_location,
                    total_distance_meters, location_count, dominant_mode, mode_breakdown,
                    start_trigger, end_trigger, synced, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    start_location = excluded.start_location,
                    end_location = excluded.end_location,
                    total_distance_meters = excluded.total_distance_meters,
                    location_count = excluded.location_count,
                    dominant_mode = excluded.dominant_mode,
                    mode_breakdown = excluded.mode_breakdown,
                    start_trigger = excluded.start_trigger,
                    end_trigger = excluded.end_trigger,
                    synced = excluded.synced,
                    updated_at = excluded.updated_at",
                params![
                    record.id,
                    record.state.as_str(),
                    format_datetime(&record.start_time),
                    record.end_time.as_ref().map(format_datetime),
                    to_optional_json(record.start_location.as_ref(), "start_location")?,
                    to_optional_json(record.end_location.as_ref(), "end_location")?,
                    record.total_distance_meters,
                    to_i64(record.location_count)?,
                    record.dominant_mode.as_str(),
                    to_json(&record.mode_breakdown, "mode_breakdown")?,
                    record.start_trigger.as_str(),
                    record.end_trigger.map(|trigger| trigger.as_str()),
                    record.synced as i64,
                    format_datetime(&record.created_at),
                    format_datetime(&record.updated_at),
                ],
            )
            .with_context(|| format!("failed to upsert trip {}", record.id))?;

            tx.execute(
                "DELETE FROM mode_segments WHERE trip_id = ?1",
                params![record.id],
            )?;
            for (seq, segment) in record.segments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO mode_segments (trip_id, seq, mode, start_time, end_time, duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.id,
                        seq as i64,
                        segment.mode.as_str(),
                        format_datetime(&segment.start_time),
                        format_datetime(&segment.end_time),
                        to_i64(segment.duration_ms())?,
                    ],
                )
                .with_context(|| format!("failed to insert segment {seq} of {}", record.id))?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_trip_by_id(&self, trip_id: &str) -> Result<Option<Trip>> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let trips = select_trips(conn, "WHERE id = ?1", params![trip_id])?;
            Ok(trips.into_iter().next())
        })
        .await
    }

    /// Trips overlapping `[start, end]`, oldest first.
    pub async fn get_trips_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trip>> {
        self.execute(move |conn| {
            select_trips(
                conn,
                "WHERE start_time <= ?2 AND COALESCE(end_time, start_time) >= ?1
                 ORDER BY start_time ASC",
                params![format_datetime(&start), format_datetime(&end)],
            )
        })
        .await
    }

    /// Most recent trips first.
    pub async fn get_recent_trips(&self, limit: u32) -> Result<Vec<Trip>> {
        self.execute(move |conn| {
            select_trips(
                conn,
                "ORDER BY start_time DESC LIMIT ?1",
                params![limit as i64],
            )
        })
        .await
    }

    /// The completed trip with the latest end time, the merge candidate for the next trip.
    pub async fn get_latest_completed_trip(&self) -> Result<Option<Trip>> {
        self.execute(|conn| {
            let trips = select_trips(
                conn,
                "WHERE state = 'COMPLETED' AND end_time IS NOT NULL
                 ORDER BY end_time DESC LIMIT 1",
                [],
            )?;
            Ok(trips.into_iter().next())
        })
        .await
    }

    pub async fn get_unsynced_trips(&self) -> Result<Vec<Trip>> {
        self.execute(|conn| {
            select_trips(
                conn,
                "WHERE synced = 0 AND state = 'COMPLETED' ORDER BY start_time ASC",
                [],
            )
        })
        .await
    }

    /// Returns whether a trip with that id existed.
    pub async fn mark_trip_synced(&self, trip_id: &str) -> Result<bool> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute("UPDATE trips SET synced = 1 WHERE id = ?1", params![trip_id])
                .context("failed to mark trip synced")?;
            Ok(changed > 0)
        })
        .await
    }

    /// Point location history and movement events of `from` at `to` (or detach them).
    pub async fn reassign_trip_references(&self, from: &str, to: Option<&str>) -> Result<()> {
        let from = from.to_string();
        let to = to.map(str::to_string);
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE location_history SET trip_id = ?2 WHERE trip_id = ?1",
                params![from, to],
            )?;
            tx.execute(
                "UPDATE movement_events SET trip_id = ?2 WHERE trip_id = ?1",
                params![from, to],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_trip_with_locations(&self, trip_id: &str) -> Result<Option<TripWithLocations>> {
        let Some(trip) = self.get_trip_by_id(trip_id).await? else {
            return Ok(None);
        };
        let end = trip.end_time.unwrap_or(trip.updated_at);
        let locations = self.get_locations_in_range(trip.start_time, end).await?;
        let matched_points = self.get_matched_points(&trip.id).await?;
        Ok(Some(TripWithLocations {
            trip,
            locations,
            matched_points,
        }))
    }
}
