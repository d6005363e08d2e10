use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::models::{DetectionSource, TransportationMode, TripState, TripTrigger};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// Fixed-width UTC form so lexical order in SQLite matches chronological order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_mode(value: &str) -> Result<TransportationMode> {
    match value {
        "STATIONARY" => Ok(TransportationMode::Stationary),
        "WALKING" => Ok(TransportationMode::Walking),
        "RUNNING" => Ok(TransportationMode::Running),
        "CYCLING" => Ok(TransportationMode::Cycling),
        "IN_VEHICLE" => Ok(TransportationMode::InVehicle),
        "UNKNOWN" => Ok(TransportationMode::Unknown),
        other => Err(anyhow!("unknown transportation mode {other}")),
    }
}

pub fn parse_trip_state(value: &str) -> Result<TripState> {
    match value {
        "IDLE" => Ok(TripState::Idle),
        "ACTIVE" => Ok(TripState::Active),
        "PENDING_END" => Ok(TripState::PendingEnd),
        "COMPLETED" => Ok(TripState::Completed),
        other => Err(anyhow!("unknown trip state {other}")),
    }
}

pub fn parse_trigger(value: &str) -> Result<TripTrigger> {
    match value {
        "MODE_CHANGE" => Ok(TripTrigger::ModeChange),
        "DISTANCE" => Ok(TripTrigger::Distance),
        "TIME" => Ok(TripTrigger::Time),
        "STATIONARY" => Ok(TripTrigger::Stationary),
        "MANUAL" => Ok(TripTrigger::Manual),
        other => Err(anyhow!("unknown trip trigger {other}")),
    }
}

pub fn parse_source(value: &str) -> Result<DetectionSource> {
    match value {
        "ACTIVITY_RECOGNITION" => Ok(DetectionSource::ActivityRecognition),
        "BLUETOOTH_CAR" => Ok(DetectionSource::BluetoothCar),
        "SENSORS" => Ok(DetectionSource::Sensors),
        "LOCATION" => Ok(DetectionSource::Location),
        "MANUAL" => Ok(DetectionSource::Manual),
        "UNKNOWN" => Ok(DetectionSource::Unknown),
        other => Err(anyhow!("unknown detection source {other}")),
    }
}

pub fn to_json<T: Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {field}"))
}

pub fn to_optional_json<T: Serialize>(value: Option<&T>, field: &str) -> Result<Option<String>> {
    value.map(|inner| to_json(inner, field)).transpose()
}

pub fn from_json<T: DeserializeOwned>(value: &str, field: &str) -> Result<T> {
    serde_json::from_str(value).with_context(|| format!("failed to parse {field}"))
}

pub fn from_optional_json<T: DeserializeOwned>(
    value: Option<String>,
    field: &str,
) -> Result<Option<T>> {
    value.map(|raw| from_json(&raw, field)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_datetime(&early), format_datetime(&late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b, "ts").unwrap(), late);
    }

    #[test]
    fn stored_names_parse_back() {
        for mode in [
            TransportationMode::Stationary,
            TransportationMode::InVehicle,
            TransportationMode::Unknown,
        ] {
            assert_eq!(parse_mode(mode.as_str()).unwrap(), mode);
        }
        assert_eq!(
            parse_trigger(TripTrigger::ModeChange.as_str()).unwrap(),
            TripTrigger::ModeChange
        );
        assert_eq!(
            parse_trip_state(TripState::PendingEnd.as_str()).unwrap(),
            TripState::PendingEnd
        );
        assert!(parse_mode("TELEPORTING").is_err());
    }
}
