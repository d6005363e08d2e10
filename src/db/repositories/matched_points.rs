use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_mode},
};
use crate::matching::MatchedPoint;

impl Database {
    /// Replace the stored map-matched geometry of a trip.
    pub async fn replace_matched_points(
        &self,
        trip_id: &str,
        points: &[MatchedPoint],
    ) -> Result<()> {
        let trip_id = trip_id.to_string();
        let points = points.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM matched_points WHERE trip_id = ?1",
                params![trip_id],
            )?;
            for (seq, point) in points.iter().enumerate() {
                tx.execute(
                    "INSERT INTO matched_points (trip_id, seq, latitude, longitude, timestamp, mode)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        trip_id,
                        seq as i64,
                        point.latitude,
                        point.longitude,
                        format_datetime(&point.timestamp),
                        point.mode.as_str(),
                    ],
                )
                .with_context(|| format!("failed to insert matched point {seq} of {trip_id}"))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_matched_points(&self, trip_id: &str) -> Result<Vec<MatchedPoint>> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT latitude, longitude, timestamp, mode
                 FROM matched_points
                 WHERE trip_id = ?1
                 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query(params![trip_id])?;
            let mut points = Vec::new();
            while let Some(row) = rows.next()? {
                points.push(MatchedPoint {
                    latitude: row.get(0)?,
                    longitude: row.get(1)?,
                    timestamp: parse_datetime(&row.get::<_, String>(2)?, "timestamp")?,
                    mode: parse_mode(&row.get::<_, String>(3)?)?,
                });
            }
            Ok(points)
        })
        .await
    }
}
