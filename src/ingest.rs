//! JSON-lines input for the command line binary.
//!
//! One record per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"mode","mode":"IN_VEHICLE","confidence":0.9,"timestamp":"2024-05-01T08:00:10Z"}
//! {"kind":"location","latitude":52.0,"longitude":13.0,"accuracy":5,"timestamp":"2024-05-01T08:00:20Z"}
//! {"kind":"forceStart"}
//! {"kind":"forceEnd","timestamp":"2024-05-01T09:00:00Z"}
//! {"kind":"backfill","start":"2024-05-01T00:00:00Z","end":"2024-05-02T00:00:00Z"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::models::{LocationSample, TransportationState};
use crate::trip::{FinalizeOutcome, TripEngine};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IngestRecord {
    Mode(TransportationState),
    Location(LocationSample),
    ForceStart {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    ForceEnd {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Backfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied: usize,
    pub rejected: usize,
}

pub fn parse_record(line: &str) -> Result<Option<IngestRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .with_context(|| format!("invalid record: {line}"))
}

/// Feed every record from `reader` into `engine`. Malformed lines and rejected manual
/// controls are logged and counted; they never stop the stream.
pub async fn ingest_stream<R>(engine: &TripEngine, reader: R) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        let record = match parse_record(&line) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(err) => {
                log_warn!("{err:#}");
                summary.rejected += 1;
                continue;
            }
        };

        match apply_record(engine, record).await {
            Ok(()) => summary.applied += 1,
            Err(err) => {
                log_warn!("{err:#}");
                summary.rejected += 1;
            }
        }
    }

    Ok(summary)
}

async fn apply_record(engine: &TripEngine, record: IngestRecord) -> Result<()> {
    match record {
        IngestRecord::Mode(state) => engine.submit_mode(state)?,
        IngestRecord::Location(sample) => engine.submit_location(sample)?,
        IngestRecord::ForceStart { timestamp } => {
            let trip = engine
                .force_start_trip_at(timestamp.unwrap_or_else(Utc::now))
                .await?;
            log_info!("Started trip {} manually", trip.id);
        }
        IngestRecord::ForceEnd { timestamp } => {
            let outcome = engine
                .force_end_trip_at(timestamp.unwrap_or_else(Utc::now))
                .await?;
            match outcome {
                FinalizeOutcome::Persisted(trip) => {
                    log_info!("Ended trip {} manually", trip.id)
                }
                FinalizeOutcome::Merged {
                    merged,
                    absorbed_id,
                } => log_info!("Ended trip {} manually; merged into {}", absorbed_id, merged.id),
                FinalizeOutcome::Discarded { trip, reason } => {
                    log_info!("Ended trip {} manually; discarded ({})", trip.id, reason.describe())
                }
            }
        }
        IngestRecord::Backfill { start, end } => {
            // Backfill reads the store directly, so queued inputs must land first.
            engine.flush().await?;
            let trips = engine.backfill_trips_from_history(start, end).await?;
            log_info!("Backfilled {} trips", trips.len());
        }
    }
    Ok(())
}
