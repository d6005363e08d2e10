use chrono::Duration;

/// Tunable thresholds for trip detection and debouncing.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Consecutive classifier updates a new moving mode needs before it is trusted
    pub min_consecutive_updates: u32,

    /// How long a transition must have lasted before it is trusted
    pub min_transition_secs: i64,

    /// Path length since the last stationary point required by the mode-change start rule
    pub start_displacement_meters: f64,

    /// Straight-line displacement from the stationary anchor that starts a trip on its own
    pub distance_trigger_meters: f64,

    /// Classifier updates below this confidence are ignored
    pub min_confidence: f64,

    /// Location samples with a worse accuracy radius are not used for distance
    pub max_location_accuracy_meters: f64,

    /// Checkpoint the open trip after this many accepted locations
    pub checkpoint_every_locations: u32,

    /// Upper bound on a telemetry collection
    pub telemetry_timeout_ms: u64,

    /// Samples kept while waiting for a start decision
    pub max_departure_samples: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_consecutive_updates: 2,
            min_transition_secs: 30,
            start_displacement_meters: 10.0,
            distance_trigger_meters: 50.0,
            min_confidence: 0.3,
            max_location_accuracy_meters: 100.0,
            checkpoint_every_locations: 10,
            telemetry_timeout_ms: 2_000,
            max_departure_samples: 512,
        }
    }
}

impl DetectionConfig {
    /// Thresholds for replaying persisted history, where each stored movement event already
    /// is a single confirmed change.
    pub fn for_replay() -> Self {
        Self {
            min_consecutive_updates: 1,
            ..Self::default()
        }
    }

    pub fn min_transition(&self) -> Duration {
        Duration::seconds(self.min_transition_secs)
    }
}
