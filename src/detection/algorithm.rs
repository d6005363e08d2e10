use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::detection::{
    config::DetectionConfig,
    debounce::{Candidate, ModeDebouncer, Observation},
};
use crate::models::{LocationSample, TransportationMode, TransportationState, TripTrigger};

/// A confirmed trip start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartDecision {
    pub trigger: TripTrigger,
    pub mode: TransportationMode,
    pub start_time: DateTime<Utc>,
    pub start_location: Option<LocationSample>,
    /// Usable samples recorded at or after `start_time`, oldest first.
    pub locations: Vec<LocationSample>,
}

impl StartDecision {
    pub fn distance_meters(&self) -> f64 {
        path_length(self.locations.iter())
    }
}

fn path_length<'a>(samples: impl Iterator<Item = &'a LocationSample>) -> f64 {
    let mut total = 0.0;
    let mut previous: Option<&LocationSample> = None;
    for sample in samples {
        if let Some(prev) = previous {
            total += prev.distance_to(sample);
        }
        previous = Some(sample);
    }
    total
}

/// Correlates the mode and location streams into start, switch and stationary decisions.
///
/// The detector only observes and answers questions; the state machine decides when to ask
/// and applies the transitions.
#[derive(Debug, Clone)]
pub struct TripDetector {
    config: DetectionConfig,
    modes: ModeDebouncer,
    /// Last confirmed stationary position.
    anchor: Option<LocationSample>,
    /// Usable samples since the anchor was last set.
    departure: VecDeque<LocationSample>,
    last_known: Option<LocationSample>,
}

impl TripDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            modes: ModeDebouncer::default(),
            anchor: None,
            departure: VecDeque::new(),
            last_known: None,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn confirmed_mode(&self) -> TransportationMode {
        self.modes.confirmed()
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.modes.candidate()
    }

    pub fn last_known_location(&self) -> Option<&LocationSample> {
        self.last_known.as_ref()
    }

    pub fn anchor(&self) -> Option<&LocationSample> {
        self.anchor.as_ref()
    }

    pub fn observe_mode(&mut self, state: &TransportationState) -> Observation {
        self.modes.observe(state, self.config.min_confidence)
    }

    /// Record a location. Returns whether the sample is accurate enough to use.
    ///
    /// While `idle` and at rest the sample becomes the new stationary anchor; otherwise it
    /// extends the departure path used by the start rules.
    pub fn observe_location(&mut self, sample: &LocationSample, idle: bool) -> bool {
        self.last_known = Some(sample.clone());
        if sample.accuracy > self.config.max_location_accuracy_meters {
            return false;
        }

        if idle {
            if self.anchor.is_none() || self.is_resting() {
                self.anchor = Some(sample.clone());
                self.departure.clear();
            } else {
                if self.departure.len() >= self.config.max_departure_samples {
                    self.departure.pop_front();
                }
                self.departure.push_back(sample.clone());
            }
        }
        true
    }

    fn is_resting(&self) -> bool {
        self.modes.latest_mode() == TransportationMode::Stationary
    }

    fn moving_candidate(&self) -> Option<&Candidate> {
        self.modes
            .candidate()
            .filter(|candidate| candidate.mode.is_moving())
    }

    /// Evaluate both start rules at `now`. Mode-change wins when both hold.
    pub fn evaluate_start(&self, now: DateTime<Utc>) -> Option<StartDecision> {
        if let Some(candidate) = self.moving_candidate() {
            let from_rest = matches!(
                self.modes.confirmed(),
                TransportationMode::Stationary | TransportationMode::Unknown
            );
            let trusted = candidate.observations >= self.config.min_consecutive_updates
                && candidate.has_lasted(now, self.config.min_transition());
            if from_rest && trusted && self.path_since_anchor() > self.config.start_displacement_meters
            {
                return Some(self.decision(
                    TripTrigger::ModeChange,
                    candidate.mode,
                    candidate.first_seen,
                ));
            }
        }

        if self.is_resting() {
            return None;
        }
        let anchor = self.anchor.as_ref()?;
        let latest = self.departure.back()?;
        if anchor.distance_to(latest) <= self.config.distance_trigger_meters {
            return None;
        }

        let (mode, start_time) = match self.moving_candidate() {
            Some(candidate) => (candidate.mode, candidate.first_seen),
            None => {
                let mode = if self.modes.confirmed().is_moving() {
                    self.modes.confirmed()
                } else {
                    TransportationMode::Unknown
                };
                let first = self.departure.front().map(|s| s.timestamp).unwrap_or(now);
                (mode, first)
            }
        };
        Some(self.decision(TripTrigger::Distance, mode, start_time))
    }

    fn decision(
        &self,
        trigger: TripTrigger,
        mode: TransportationMode,
        start_time: DateTime<Utc>,
    ) -> StartDecision {
        let locations: Vec<LocationSample> = self
            .departure
            .iter()
            .filter(|sample| sample.timestamp >= start_time)
            .cloned()
            .collect();
        let start_location = locations.first().cloned().or_else(|| self.anchor.clone());
        StartDecision {
            trigger,
            mode,
            start_time,
            start_location,
            locations,
        }
    }

    fn path_since_anchor(&self) -> f64 {
        path_length(self.anchor.iter().chain(self.departure.iter()))
    }

    /// A moving candidate different from `current` that passed the debounce.
    pub fn evaluate_switch(
        &self,
        current: TransportationMode,
        now: DateTime<Utc>,
    ) -> Option<Candidate> {
        let candidate = self.moving_candidate()?;
        if candidate.mode == current {
            return None;
        }
        let trusted = candidate.observations >= self.config.min_consecutive_updates
            && candidate.has_lasted(now, self.config.min_transition());
        trusted.then(|| candidate.clone())
    }

    /// First observation of a pending STATIONARY candidate.
    pub fn stationary_since(&self) -> Option<DateTime<Utc>> {
        self.modes
            .candidate()
            .filter(|candidate| candidate.mode == TransportationMode::Stationary)
            .map(|candidate| candidate.first_seen)
    }

    /// A STATIONARY candidate that has held for the debounce window.
    pub fn stationary_settled(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let since = self.stationary_since()?;
        (now - since >= self.config.min_transition()).then_some(since)
    }

    pub fn accept_candidate(&mut self) -> Option<Candidate> {
        self.modes.accept()
    }

    pub fn force_mode(&mut self, mode: TransportationMode) {
        self.modes.force(mode);
    }

    /// Forget the departure path once a trip has opened.
    pub fn begin_trip(&mut self, mode: TransportationMode) {
        if mode.is_moving() {
            self.modes.force(mode);
        }
        self.departure.clear();
    }

    /// Re-anchor at the trip's end point.
    pub fn end_trip(&mut self, end_location: Option<LocationSample>, mode: TransportationMode) {
        self.modes.force(mode);
        if let Some(location) = end_location.or_else(|| self.last_known.clone()) {
            self.anchor = Some(location);
        }
        self.departure.clear();
    }
}
