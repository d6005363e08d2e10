use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, from_json, to_json},
};
use crate::trip::TripCheckpoint;

impl Database {
    /// There is at most one open trip, so the checkpoint table holds a single row.
    pub async fn save_checkpoint(&self, checkpoint: &TripCheckpoint) -> Result<()> {
        let trip_id = checkpoint.open.trip.id.clone();
        let saved_at = format_datetime(&checkpoint.saved_at);
        let payload = to_json(checkpoint, "checkpoint")?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO open_trip_checkpoint (slot, trip_id, payload, saved_at)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(slot) DO UPDATE SET
                    trip_id = excluded.trip_id,
                    payload = excluded.payload,
                    saved_at = excluded.saved_at",
                params![trip_id, payload, saved_at],
            )
            .context("failed to save open trip checkpoint")?;
            Ok(())
        })
        .await
    }

    pub async fn load_checkpoint(&self) -> Result<Option<TripCheckpoint>> {
        self.execute(|conn| {
            let mut stmt =
                conn.prepare("SELECT payload FROM open_trip_checkpoint WHERE slot = 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => {
                    let payload: String = row.get(0)?;
                    Ok(Some(from_json(&payload, "checkpoint")?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn clear_checkpoint(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM open_trip_checkpoint", [])
                .context("failed to clear open trip checkpoint")?;
            Ok(())
        })
        .await
    }
}
