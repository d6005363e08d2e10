use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DetectionSource, TransportationMode, TransportationState};

/// A mode the classifier is reporting that has not been trusted yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub mode: TransportationMode,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observations: u32,
    pub source: DetectionSource,
}

impl Candidate {
    fn new(state: &TransportationState) -> Self {
        Self {
            mode: state.mode,
            first_seen: state.timestamp,
            last_seen: state.timestamp,
            observations: 1,
            source: state.source,
        }
    }

    pub fn has_lasted(&self, now: DateTime<Utc>, min: Duration) -> bool {
        now - self.first_seen >= min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Below the confidence floor, or UNKNOWN.
    Ignored,
    /// Same as the confirmed mode; any pending candidate was a flicker and is dropped.
    Unchanged,
    /// Counted towards a candidate.
    Pending,
}

/// Separates the confirmed mode from a not-yet-trusted candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModeDebouncer {
    confirmed: TransportationMode,
    candidate: Option<Candidate>,
}

impl Default for ModeDebouncer {
    fn default() -> Self {
        Self {
            confirmed: TransportationMode::Unknown,
            candidate: None,
        }
    }
}

impl ModeDebouncer {
    pub fn confirmed(&self) -> TransportationMode {
        self.confirmed
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    /// Candidate mode if one is pending, otherwise the confirmed mode.
    pub fn latest_mode(&self) -> TransportationMode {
        self.candidate
            .as_ref()
            .map(|candidate| candidate.mode)
            .unwrap_or(self.confirmed)
    }

    pub fn observe(&mut self, state: &TransportationState, min_confidence: f64) -> Observation {
        if state.mode == TransportationMode::Unknown || state.confidence < min_confidence {
            return Observation::Ignored;
        }

        if state.mode == self.confirmed {
            self.candidate = None;
            return Observation::Unchanged;
        }

        match self.candidate.as_mut() {
            Some(candidate) if candidate.mode == state.mode => {
                candidate.observations = candidate.observations.saturating_add(1);
                candidate.last_seen = state.timestamp;
            }
            _ => self.candidate = Some(Candidate::new(state)),
        }
        Observation::Pending
    }

    /// Promote the pending candidate to confirmed.
    pub fn accept(&mut self) -> Option<Candidate> {
        let candidate = self.candidate.take()?;
        self.confirmed = candidate.mode;
        Some(candidate)
    }

    /// Set the confirmed mode directly, dropping any candidate.
    pub fn force(&mut self, mode: TransportationMode) {
        self.confirmed = mode;
        self.candidate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(mode: TransportationMode, confidence: f64, secs: i64) -> TransportationState {
        TransportationState::new(
            mode,
            confidence,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs),
        )
    }

    #[test]
    fn repeated_updates_accumulate_on_one_candidate() {
        let mut debouncer = ModeDebouncer::default();
        debouncer.observe(&state(TransportationMode::Walking, 0.9, 0), 0.3);
        debouncer.observe(&state(TransportationMode::Walking, 0.9, 20), 0.3);

        let candidate = debouncer.candidate().unwrap();
        assert_eq!(candidate.observations, 2);
        assert_eq!(candidate.first_seen, state(TransportationMode::Walking, 0.9, 0).timestamp);
    }

    #[test]
    fn returning_to_confirmed_mode_drops_the_flicker() {
        let mut debouncer = ModeDebouncer::default();
        debouncer.force(TransportationMode::Walking);
        assert_eq!(
            debouncer.observe(&state(TransportationMode::Stationary, 0.8, 0), 0.3),
            Observation::Pending
        );
        assert_eq!(
            debouncer.observe(&state(TransportationMode::Walking, 0.8, 10), 0.3),
            Observation::Unchanged
        );
        assert!(debouncer.candidate().is_none());
        assert_eq!(debouncer.confirmed(), TransportationMode::Walking);
    }

    #[test]
    fn low_confidence_and_unknown_are_ignored() {
        let mut debouncer = ModeDebouncer::default();
        assert_eq!(
            debouncer.observe(&state(TransportationMode::Cycling, 0.1, 0), 0.3),
            Observation::Ignored
        );
        assert_eq!(
            debouncer.observe(&state(TransportationMode::Unknown, 1.0, 1), 0.3),
            Observation::Ignored
        );
        assert!(debouncer.candidate().is_none());
    }

    #[test]
    fn a_different_mode_replaces_the_candidate() {
        let mut debouncer = ModeDebouncer::default();
        debouncer.observe(&state(TransportationMode::Walking, 0.9, 0), 0.3);
        debouncer.observe(&state(TransportationMode::Cycling, 0.9, 5), 0.3);

        let candidate = debouncer.accept().unwrap();
        assert_eq!(candidate.mode, TransportationMode::Cycling);
        assert_eq!(candidate.observations, 1);
        assert_eq!(debouncer.confirmed(), TransportationMode::Cycling);
    }
}
