//! Movement event data model.
//!
//! One immutable record per observed mode transition, with whatever device context could be
//! collected at the time. Every context field is optional: a failed or slow collector leaves
//! them empty rather than dropping the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DetectionSource, LocationSample, TransportationMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorTelemetry {
    pub accelerometer_magnitude: Option<f64>,
    pub accelerometer_variance: Option<f64>,
    pub gyroscope_magnitude: Option<f64>,
    pub step_count: Option<u32>,
    pub step_cadence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub battery_level: Option<f64>,
    pub is_charging: Option<bool>,
    pub network_type: Option<String>,
    pub screen_on: Option<bool>,
}

/// What a telemetry provider returns from one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub sensors: Option<SensorTelemetry>,
    pub device: Option<DeviceState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MovementEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub previous_mode: TransportationMode,
    pub new_mode: TransportationMode,
    pub source: DetectionSource,
    pub confidence: f64,
    pub detection_latency_ms: u64,
    pub location: Option<LocationSample>,
    pub device_state: Option<DeviceState>,
    pub sensor_telemetry: Option<SensorTelemetry>,
}
