use chrono::{DateTime, Utc};
use thiserror::Error;

/// Recoverable conditions surfaced by the trip engine. None of them is fatal; callers
/// either ignore them after logging or retry (see [`EngineError::is_retryable`]).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input at {received} is older than the last applied event at {last_applied}")]
    InputOutOfOrder {
        received: DateTime<Utc>,
        last_applied: DateTime<Utc>,
    },

    #[error("{field} = {value} is outside [{min}, {max}]; clamped to {clamped}")]
    InvalidConfiguration {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
        clamped: f64,
    },

    #[error("telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("timer generation {generation} already fired; cancellation ignored")]
    TimerRaceLost { generation: u64 },

    #[error("failed to persist {what}: {reason}")]
    PersistenceFailure { what: String, reason: String },

    #[error("trip {0} is already open")]
    TripAlreadyOpen(String),

    #[error("no open trip")]
    NoOpenTrip,

    #[error("trip engine is not running")]
    EngineStopped,
}

impl EngineError {
    pub fn persistence(what: impl Into<String>, err: &anyhow::Error) -> Self {
        EngineError::PersistenceFailure {
            what: what.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PersistenceFailure { .. })
    }
}
