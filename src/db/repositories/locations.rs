use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
};
use crate::models::LocationSample;

fn row_to_location(row: &Row) -> Result<LocationSample> {
    Ok(LocationSample {
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        accuracy: row.get("accuracy")?,
        speed: row.get("speed")?,
        timestamp: parse_datetime(&row.get::<_, String>("recorded_at")?, "recorded_at")?,
    })
}

impl Database {
    pub async fn insert_location(
        &self,
        sample: &LocationSample,
        trip_id: Option<&str>,
    ) -> Result<()> {
        self.insert_locations(std::slice::from_ref(sample), trip_id)
            .await
    }

    /// Batch insert in one transaction.
    pub async fn insert_locations(
        &self,
        samples: &[LocationSample],
        trip_id: Option<&str>,
    ) -> Result<()> {
        let samples = samples.to_vec();
        let trip_id = trip_id.map(str::to_string);
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            for sample in &samples {
                tx.execute(
                    "INSERT INTO location_history (trip_id, latitude, longitude, accuracy, speed, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        trip_id,
                        sample.latitude,
                        sample.longitude,
                        sample.accuracy,
                        sample.speed,
                        format_datetime(&sample.timestamp),
                    ],
                )
                .context("failed to insert location sample")?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Samples recorded within `[start, end]`, oldest first.
    pub async fn get_locations_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT latitude, longitude, accuracy, speed, recorded_at
                 FROM location_history
                 WHERE recorded_at >= ?1 AND recorded_at <= ?2
                 ORDER BY recorded_at ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![format_datetime(&start), format_datetime(&end)])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_location(row)?);
            }
            Ok(samples)
        })
        .await
    }

    pub async fn get_locations_for_trip(&self, trip_id: &str) -> Result<Vec<LocationSample>> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT latitude, longitude, accuracy, speed, recorded_at
                 FROM location_history
                 WHERE trip_id = ?1
                 ORDER BY recorded_at ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![trip_id])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_location(row)?);
            }
            Ok(samples)
        })
        .await
    }

    /// Tag unassigned samples inside `[start, end]` with `trip_id`.
    pub async fn assign_locations_to_trip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trip_id: &str,
    ) -> Result<usize> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE location_history SET trip_id = ?3
                 WHERE trip_id IS NULL AND recorded_at >= ?1 AND recorded_at <= ?2",
                params![format_datetime(&start), format_datetime(&end), trip_id],
            )?;
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[tokio::test]
    async fn history_is_returned_in_time_order_within_range() {
        let db = Database::in_memory().unwrap();
        let mut fast = LocationSample::new(52.001, 13.0, 8.0, t(20));
        fast.speed = Some(13.5);
        db.insert_location(&fast, Some("trip-1")).await.unwrap();
        db.insert_locations(
            &[
                LocationSample::new(52.0, 13.0, 5.0, t(10)),
                LocationSample::new(52.002, 13.0, 5.0, t(90)),
            ],
            None,
        )
        .await
        .unwrap();

        let samples = db.get_locations_in_range(t(0), t(60)).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, t(10));
        assert_eq!(samples[1], fast);

        let tagged = db.get_locations_for_trip("trip-1").await.unwrap();
        assert_eq!(tagged, vec![fast]);
    }

    #[tokio::test]
    async fn assigning_only_touches_untagged_samples() {
        let db = Database::in_memory().unwrap();
        db.insert_location(&LocationSample::new(52.0, 13.0, 5.0, t(10)), Some("other"))
            .await
            .unwrap();
        db.insert_location(&LocationSample::new(52.0, 13.0, 5.0, t(20)), None)
            .await
            .unwrap();

        let changed = db.assign_locations_to_trip(t(0), t(30), "new").await.unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.get_locations_for_trip("new").await.unwrap().len(), 1);

        db.reassign_trip_references("new", None).await.unwrap();
        assert!(db.get_locations_for_trip("new").await.unwrap().is_empty());
    }
}
