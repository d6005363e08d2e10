use anyhow::{Context, Result};
use chrono::Duration;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::error::EngineError;

/// User-facing trip detection settings. Numeric fields have documented ranges; anything
/// outside is clamped to the nearest bound rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TripSettings {
    pub trip_detection_enabled: bool,
    pub stationary_threshold_minutes: u32,
    pub minimum_duration_minutes: u32,
    pub minimum_distance_meters: f64,
    pub auto_merge_enabled: bool,
    pub vehicle_grace_seconds: u32,
    pub walking_grace_seconds: u32,
    /// Largest gap between two trips that auto-merge will bridge.
    pub merge_window_seconds: u32,
}

impl Default for TripSettings {
    fn default() -> Self {
        Self {
            trip_detection_enabled: true,
            stationary_threshold_minutes: 5,
            minimum_duration_minutes: 2,
            minimum_distance_meters: 100.0,
            auto_merge_enabled: true,
            vehicle_grace_seconds: 90,
            walking_grace_seconds: 60,
            merge_window_seconds: 60,
        }
    }
}

fn clamp_u32(field: &'static str, value: u32, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(
            "{}",
            EngineError::InvalidConfiguration {
                field,
                value: value as f64,
                min: min as f64,
                max: max as f64,
                clamped: clamped as f64,
            }
        );
    }
    clamped
}

fn clamp_f64(field: &'static str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = if value.is_nan() { min } else { value.clamp(min, max) };
    if clamped != value {
        warn!(
            "{}",
            EngineError::InvalidConfiguration {
                field,
                value,
                min,
                max,
                clamped,
            }
        );
    }
    clamped
}

impl TripSettings {
    pub fn clamped(self) -> Self {
        Self {
            trip_detection_enabled: self.trip_detection_enabled,
            stationary_threshold_minutes: clamp_u32(
                "stationaryThresholdMinutes",
                self.stationary_threshold_minutes,
                1,
                30,
            ),
            minimum_duration_minutes: clamp_u32(
                "minimumDurationMinutes",
                self.minimum_duration_minutes,
                1,
                10,
            ),
            minimum_distance_meters: clamp_f64(
                "minimumDistanceMeters",
                self.minimum_distance_meters,
                50.0,
                500.0,
            ),
            auto_merge_enabled: self.auto_merge_enabled,
            vehicle_grace_seconds: clamp_u32(
                "vehicleGraceSeconds",
                self.vehicle_grace_seconds,
                30,
                180,
            ),
            walking_grace_seconds: clamp_u32(
                "walkingGraceSeconds",
                self.walking_grace_seconds,
                30,
                120,
            ),
            merge_window_seconds: clamp_u32("mergeWindowSeconds", self.merge_window_seconds, 0, 600),
        }
    }

    pub fn stationary_threshold(&self) -> Duration {
        Duration::minutes(self.stationary_threshold_minutes as i64)
    }

    pub fn minimum_duration(&self) -> Duration {
        Duration::minutes(self.minimum_duration_minutes as i64)
    }

    pub fn merge_window(&self) -> Duration {
        Duration::seconds(self.merge_window_seconds as i64)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<TripSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<TripSettings>(&contents) {
                Ok(settings) => settings.clamped(),
                Err(err) => {
                    warn!(
                        "Ignoring unreadable settings at {}: {err}",
                        path.display()
                    );
                    TripSettings::default()
                }
            }
        } else {
            TripSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn trip_settings(&self) -> TripSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_trip_settings(&self, settings: TripSettings) -> Result<TripSettings> {
        let settings = settings.clamped();
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings.clone();
        self.persist(&guard)?;
        Ok(settings)
    }

    fn persist(&self, data: &TripSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let settings = TripSettings {
            stationary_threshold_minutes: 0,
            minimum_duration_minutes: 45,
            minimum_distance_meters: 10.0,
            vehicle_grace_seconds: 400,
            walking_grace_seconds: 5,
            merge_window_seconds: 10_000,
            ..TripSettings::default()
        }
        .clamped();

        assert_eq!(settings.stationary_threshold_minutes, 1);
        assert_eq!(settings.minimum_duration_minutes, 10);
        assert_eq!(settings.minimum_distance_meters, 50.0);
        assert_eq!(settings.vehicle_grace_seconds, 180);
        assert_eq!(settings.walking_grace_seconds, 30);
        assert_eq!(settings.merge_window_seconds, 600);
    }

    #[test]
    fn defaults_are_already_in_range() {
        assert_eq!(TripSettings::default().clamped(), TripSettings::default());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let parsed: TripSettings =
            serde_json::from_str(r#"{"vehicleGraceSeconds": 120}"#).unwrap();
        assert_eq!(parsed.vehicle_grace_seconds, 120);
        assert_eq!(parsed.walking_grace_seconds, 60);
        assert!(parsed.auto_merge_enabled);
    }

    #[test]
    fn store_persists_clamped_updates() {
        let path = std::env::temp_dir().join(format!(
            "tripwatch-settings-{}.json",
            uuid::Uuid::new_v4()
        ));
        let store = SettingsStore::new(path.clone()).unwrap();
        let saved = store
            .update_trip_settings(TripSettings {
                walking_grace_seconds: 500,
                ..TripSettings::default()
            })
            .unwrap();
        assert_eq!(saved.walking_grace_seconds, 120);

        let reloaded = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reloaded.trip_settings().walking_grace_seconds, 120);
        let _ = fs::remove_file(path);
    }
}
