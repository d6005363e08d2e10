//! Transportation mode classifications consumed from the external classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportationMode {
    Stationary,
    Walking,
    Running,
    Cycling,
    InVehicle,
    Unknown,
}

impl TransportationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportationMode::Stationary => "STATIONARY",
            TransportationMode::Walking => "WALKING",
            TransportationMode::Running => "RUNNING",
            TransportationMode::Cycling => "CYCLING",
            TransportationMode::InVehicle => "IN_VEHICLE",
            TransportationMode::Unknown => "UNKNOWN",
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            TransportationMode::Walking
                | TransportationMode::Running
                | TransportationMode::Cycling
                | TransportationMode::InVehicle
        )
    }

    /// Fastest speed a map-matched snap may imply for this mode.
    pub fn max_plausible_speed_kmh(&self) -> Option<f64> {
        match self {
            TransportationMode::Walking => Some(7.0),
            TransportationMode::Running => Some(20.0),
            TransportationMode::Cycling => Some(40.0),
            TransportationMode::InVehicle => Some(150.0),
            TransportationMode::Stationary | TransportationMode::Unknown => None,
        }
    }
}

impl Default for TransportationMode {
    fn default() -> Self {
        TransportationMode::Unknown
    }
}

/// Mechanism that produced a classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionSource {
    ActivityRecognition,
    BluetoothCar,
    Sensors,
    Location,
    Manual,
    Unknown,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::ActivityRecognition => "ACTIVITY_RECOGNITION",
            DetectionSource::BluetoothCar => "BLUETOOTH_CAR",
            DetectionSource::Sensors => "SENSORS",
            DetectionSource::Location => "LOCATION",
            DetectionSource::Manual => "MANUAL",
            DetectionSource::Unknown => "UNKNOWN",
        }
    }
}

impl Default for DetectionSource {
    fn default() -> Self {
        DetectionSource::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportationState {
    pub mode: TransportationMode,
    pub confidence: f64,
    #[serde(default)]
    pub source: DetectionSource,
    pub timestamp: DateTime<Utc>,
}

impl TransportationState {
    pub fn new(mode: TransportationMode, confidence: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            mode,
            confidence: confidence.clamp(0.0, 1.0),
            source: DetectionSource::ActivityRecognition,
            timestamp,
        }
    }
}
