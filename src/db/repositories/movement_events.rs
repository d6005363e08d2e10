use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, from_optional_json, parse_datetime, parse_mode, parse_source, to_i64,
        to_optional_json, to_u64,
    },
};
use crate::models::MovementEvent;

const EVENT_COLUMNS: &str = "id, timestamp, trip_id, previous_mode, new_mode, source, confidence,
    detection_latency_ms, location, device_state, sensor_telemetry";

fn row_to_event(row: &Row) -> Result<MovementEvent> {
    Ok(MovementEvent {
        id: row.get("id")?,
        timestamp: parse_datetime(&row.get::<_, String>("timestamp")?, "timestamp")?,
        trip_id: row.get("trip_id")?,
        previous_mode: parse_mode(&row.get::<_, String>("previous_mode")?)?,
        new_mode: parse_mode(&row.get::<_, String>("new_mode")?)?,
        source: parse_source(&row.get::<_, String>("source")?)?,
        confidence: row.get("confidence")?,
        detection_latency_ms: to_u64(row.get("detection_latency_ms")?, "detection_latency_ms")?,
        location: from_optional_json(row.get("location")?, "location")?,
        device_state: from_optional_json(row.get("device_state")?, "device_state")?,
        sensor_telemetry: from_optional_json(row.get("sensor_telemetry")?, "sensor_telemetry")?,
    })
}

impl Database {
    /// Movement events are immutable; inserting an id twice is a no-op.
    pub async fn insert_movement_event(&self, event: &MovementEvent) -> Result<()> {
        let record = event.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO movement_events (
                    id, timestamp, trip_id, previous_mode, new_mode, source, confidence,
                    detection_latency_ms, location, device_state, sensor_telemetry
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    format_datetime(&record.timestamp),
                    record.trip_id,
                    record.previous_mode.as_str(),
                    record.new_mode.as_str(),
                    record.source.as_str(),
                    record.confidence,
                    to_i64(record.detection_latency_ms)?,
                    to_optional_json(record.location.as_ref(), "location")?,
                    to_optional_json(record.device_state.as_ref(), "device_state")?,
                    to_optional_json(record.sensor_telemetry.as_ref(), "sensor_telemetry")?,
                ],
            )
            .with_context(|| format!("failed to insert movement event {}", record.id))?;
            Ok(())
        })
        .await
    }

    /// Events within `[start, end]`, oldest first.
    pub async fn get_movement_events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MovementEvent>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM movement_events
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                 ORDER BY timestamp ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![format_datetime(&start), format_datetime(&end)])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    pub async fn get_movement_events_for_trip(&self, trip_id: &str) -> Result<Vec<MovementEvent>> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM movement_events
                 WHERE trip_id = ?1
                 ORDER BY timestamp ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![trip_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DetectionSource, DeviceState, LocationSample, SensorTelemetry, TransportationMode,
    };
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(id: &str, secs: i64, telemetry: bool) -> MovementEvent {
        MovementEvent {
            id: id.to_string(),
            timestamp: t(secs),
            trip_id: Some("trip-1".into()),
            previous_mode: TransportationMode::Walking,
            new_mode: TransportationMode::InVehicle,
            source: DetectionSource::BluetoothCar,
            confidence: 0.85,
            detection_latency_ms: 12_000,
            location: Some(LocationSample::new(52.0, 13.0, 5.0, t(secs))),
            device_state: telemetry.then(|| DeviceState {
                battery_level: Some(0.62),
                is_charging: Some(false),
                network_type: Some("wifi".into()),
                screen_on: Some(true),
            }),
            sensor_telemetry: telemetry.then(|| SensorTelemetry {
                accelerometer_magnitude: Some(9.9),
                step_count: Some(12),
                ..SensorTelemetry::default()
            }),
        }
    }

    #[tokio::test]
    async fn events_keep_optional_telemetry() {
        let db = Database::in_memory().unwrap();
        let with = event("with", 10, true);
        let without = event("without", 20, false);
        db.insert_movement_event(&with).await.unwrap();
        db.insert_movement_event(&without).await.unwrap();
        db.insert_movement_event(&with).await.unwrap();

        let events = db.get_movement_events_in_range(t(0), t(60)).await.unwrap();
        assert_eq!(events, vec![with, without]);
        assert!(events[1].device_state.is_none());

        let for_trip = db.get_movement_events_for_trip("trip-1").await.unwrap();
        assert_eq!(for_trip.len(), 2);
    }
}
