pub mod db;
pub mod detection;
pub mod error;
pub mod ingest;
pub mod matching;
pub mod models;
pub mod movement;
pub mod settings;
pub mod tracking;
pub mod trip;
mod utils;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::io::BufReader;

use db::Database;
use settings::SettingsStore;
use trip::{ClockSource, EngineOptions, TripEngine};

pub use error::EngineError;

const DEFAULT_DATA_DIR: &str = "tripwatch-data";

enum Command {
    /// Read JSON-lines records from stdin until EOF or Ctrl-C.
    Ingest,
    Backfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Trips {
        limit: u32,
    },
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("ingest") => Ok(Command::Ingest),
        Some("backfill") => {
            let [start, end] = &args[1..] else {
                bail!("usage: tripwatch backfill <start RFC3339> <end RFC3339>");
            };
            let parse = |value: &str| {
                DateTime::parse_from_rfc3339(value)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("invalid timestamp {value}"))
            };
            Ok(Command::Backfill {
                start: parse(start.as_str())?,
                end: parse(end.as_str())?,
            })
        }
        Some("trips") => {
            let limit = match args.get(1) {
                Some(value) => value.parse().context("limit must be a number")?,
                None => 20,
            };
            Ok(Command::Trips { limit })
        }
        Some(other) => bail!("unknown command {other}; expected ingest, backfill or trips"),
    }
}

fn clock_from_env() -> ClockSource {
    match std::env::var("TRIPWATCH_CLOCK").as_deref() {
        Ok("event") => ClockSource::EventTime,
        Ok("wall") | Err(_) => ClockSource::WallClock,
        Ok(other) => {
            warn!("Unknown TRIPWATCH_CLOCK {other}; using wall clock");
            ClockSource::WallClock
        }
    }
}

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(serve(command));
    // A blocked stdin read would otherwise hold the runtime open after Ctrl-C.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    result
}

async fn serve(command: Command) -> Result<()> {
    let data_dir = std::env::var_os("TRIPWATCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    info!("tripwatch starting up in {}", data_dir.display());

    let settings_store = SettingsStore::new(data_dir.join("settings.json"))?;
    let database = Database::new(data_dir.join("tripwatch.sqlite3"))?;

    let options = EngineOptions {
        clock: clock_from_env(),
        ..EngineOptions::new(settings_store.trip_settings())
    };
    let engine = TripEngine::start(database, options).await?;

    let result = match command {
        Command::Ingest => {
            let stdin = BufReader::new(tokio::io::stdin());
            tokio::select! {
                summary = ingest::ingest_stream(&engine, stdin) => {
                    summary.map(|summary| {
                        info!(
                            "Input closed: {} records applied, {} rejected",
                            summary.applied, summary.rejected
                        );
                    })
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted; flushing");
                    Ok(())
                }
            }
        }
        Command::Backfill { start, end } => engine
            .backfill_trips_from_history(start, end)
            .await
            .map(|trips| info!("Backfilled {} trips", trips.len()))
            .map_err(anyhow::Error::from),
        Command::Trips { limit } => print_recent_trips(&engine, limit).await,
    };

    engine.shutdown().await;
    result
}

async fn print_recent_trips(engine: &TripEngine, limit: u32) -> Result<()> {
    for trip in engine.get_recent_trips(limit).await? {
        println!("{}", serde_json::to_string(&trip)?);
    }
    Ok(())
}
