//! Trip lifecycle state machine.
//!
//! `TripStateMachine::apply` is the single transition function for the open trip. It is
//! pure with respect to I/O: every side effect (persisting, arming timers, publishing state)
//! is returned as an [`Effect`] for the caller to carry out. Time comes exclusively from
//! input timestamps and timer deadlines, which makes replaying history deterministic.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::{DetectionConfig, Observation, StartDecision, TripDetector};
use crate::error::EngineError;
use crate::models::{
    LocationSample, TransportationMode, TransportationState, Trip, TripState, TripTrigger,
};
use crate::settings::TripSettings;
use crate::tracking::{apply_summary, ModeSegmentTracker};

use super::grace::{grace_period_for, PendingTimer, TimerPurpose};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Mode(TransportationState),
    Location(LocationSample),
    TimerFired(PendingTimer),
    ForceStart { at: DateTime<Utc> },
    ForceEnd { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StateChanged(TripState),
    ArmTimer(PendingTimer),
    CancelTimer(u64),
    LocationAccepted {
        sample: LocationSample,
        trip_id: Option<String>,
    },
    /// The open trip changed in a way worth persisting for crash recovery.
    Checkpoint,
    TripCompleted(Trip),
}

/// The open trip plus everything needed to resume it after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenTrip {
    pub trip: Trip,
    pub tracker: ModeSegmentTracker,
    pub last_location: Option<LocationSample>,
    pub stationary_start: Option<DateTime<Utc>>,
    pub stationary_location: Option<LocationSample>,
    /// Picks the grace period when the trip goes stationary.
    pub last_moving_mode: TransportationMode,
    pub timer: Option<PendingTimer>,
    pub last_input_at: DateTime<Utc>,
    pub locations_since_checkpoint: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripCheckpoint {
    pub open: OpenTrip,
    pub saved_at: DateTime<Utc>,
}

pub struct TripStateMachine {
    settings: TripSettings,
    detector: TripDetector,
    state: TripState,
    open: Option<OpenTrip>,
    next_generation: u64,
    last_applied_at: Option<DateTime<Utc>>,
}

impl TripStateMachine {
    pub fn new(settings: TripSettings, detection: DetectionConfig) -> Self {
        Self {
            settings: settings.clamped(),
            detector: TripDetector::new(detection),
            state: TripState::Idle,
            open: None,
            next_generation: 1,
            last_applied_at: None,
        }
    }

    pub fn state(&self) -> TripState {
        self.state
    }

    pub fn settings(&self) -> &TripSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: TripSettings) {
        self.settings = settings.clamped();
    }

    pub fn open_trip(&self) -> Option<&OpenTrip> {
        self.open.as_ref()
    }

    pub fn open_trip_id(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.trip.id.as_str())
    }

    pub fn last_known_location(&self) -> Option<&LocationSample> {
        self.detector.last_known_location()
    }

    /// The open trip with segments and breakdown as of the last applied input.
    pub fn active_trip(&self) -> Option<Trip> {
        let open = self.open.as_ref()?;
        let mut trip = open.trip.clone();
        trip.state = self.state;
        trip.segments = open.tracker.snapshot(open.last_input_at);
        apply_summary(&mut trip);
        Some(trip)
    }

    pub fn checkpoint(&self) -> Option<TripCheckpoint> {
        self.open.as_ref().map(|open| TripCheckpoint {
            open: open.clone(),
            saved_at: open.last_input_at,
        })
    }

    /// Rebuild the open trip from a checkpoint.
    ///
    /// A pending grace period keeps its original deadline (`stationaryStart + grace`); if
    /// that deadline already passed at `now` the trip completes immediately. The inactivity
    /// timeout is applied the same way.
    pub fn restore(&mut self, checkpoint: TripCheckpoint, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut open = checkpoint.open;

        self.state = if open.trip.state == TripState::PendingEnd {
            TripState::PendingEnd
        } else {
            TripState::Active
        };
        open.trip.state = self.state;

        let confirmed = if self.state == TripState::PendingEnd {
            TransportationMode::Stationary
        } else {
            open.tracker.current_mode()
        };
        self.detector.force_mode(confirmed);
        if let Some(location) = open.last_location.clone() {
            self.detector.observe_location(&location, false);
        }

        // Only the grace deadline survives a restart; a stationary confirmation needs its
        // candidate, which is not persisted.
        let stationary_start = open.stationary_start;
        let last_moving_mode = open.last_moving_mode;
        open.timer = None;
        self.last_applied_at = Some(open.last_input_at);
        self.open = Some(open);
        effects.push(Effect::StateChanged(self.state));

        if let (TripState::PendingEnd, Some(since)) = (self.state, stationary_start) {
            let deadline = since + grace_period_for(last_moving_mode, &self.settings);
            self.arm(TimerPurpose::GraceExpiry, deadline, &mut effects);
        }

        info!(
            "Restored open trip {} in state {}",
            self.open_trip_id().unwrap_or("?"),
            self.state.as_str()
        );
        self.advance(now, &mut effects);
        effects
    }

    /// Apply one input. Out-of-order stream inputs are rejected without changing state.
    pub fn apply(&mut self, input: EngineInput) -> Result<Vec<Effect>, EngineError> {
        let mut effects = Vec::new();
        match input {
            EngineInput::TimerFired(timer) => self.on_timer(timer, &mut effects),
            EngineInput::ForceStart { at } => {
                let at = self.not_before_last_applied(at);
                self.force_start(at, &mut effects)?;
            }
            EngineInput::ForceEnd { at } => {
                let at = self.not_before_last_applied(at);
                self.force_end(at, &mut effects)?;
            }
            EngineInput::Mode(state) => {
                self.admit(state.timestamp)?;
                self.advance(state.timestamp, &mut effects);
                self.on_mode(&state, &mut effects);
                self.touch(state.timestamp);
            }
            EngineInput::Location(sample) => {
                self.admit(sample.timestamp)?;
                self.advance(sample.timestamp, &mut effects);
                self.on_location(sample.clone(), &mut effects);
                self.touch(sample.timestamp);
            }
        }
        Ok(effects)
    }

    /// Fire every timer due at or before `now` and apply the inactivity timeout.
    pub fn advance(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        while let Some(timer) = self.open.as_ref().and_then(|open| open.timer) {
            if timer.deadline > now {
                break;
            }
            effects.push(Effect::CancelTimer(timer.generation));
            self.fire(timer, effects);
        }
        self.check_inactivity(now, effects);
    }

    fn admit(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(last_applied) = self.last_applied_at {
            if at < last_applied {
                return Err(EngineError::InputOutOfOrder {
                    received: at,
                    last_applied,
                });
            }
        }
        self.last_applied_at = Some(at);
        Ok(())
    }

    fn not_before_last_applied(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = self.last_applied_at.map_or(at, |last| at.max(last));
        self.last_applied_at = Some(at);
        at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if let Some(open) = self.open.as_mut() {
            open.last_input_at = open.last_input_at.max(at);
            open.trip.updated_at = open.last_input_at;
        }
    }

    fn next_timer(&mut self, purpose: TimerPurpose, deadline: DateTime<Utc>) -> PendingTimer {
        let generation = self.next_generation;
        self.next_generation += 1;
        PendingTimer {
            generation,
            purpose,
            deadline,
        }
    }

    fn arm(&mut self, purpose: TimerPurpose, deadline: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let timer = self.next_timer(purpose, deadline);
        if let Some(open) = self.open.as_mut() {
            if let Some(previous) = open.timer.replace(timer) {
                effects.push(Effect::CancelTimer(previous.generation));
            }
            effects.push(Effect::ArmTimer(timer));
        }
    }

    fn disarm(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.open.as_mut().and_then(|open| open.timer.take()) {
            effects.push(Effect::CancelTimer(timer.generation));
        }
    }

    fn on_timer(&mut self, timer: PendingTimer, effects: &mut Vec<Effect>) {
        let current = self.open.as_ref().and_then(|open| open.timer);
        if current.map(|t| t.generation) != Some(timer.generation) {
            debug!("Ignoring stale timer generation {}", timer.generation);
            return;
        }
        self.fire(timer, effects);
    }

    fn fire(&mut self, timer: PendingTimer, effects: &mut Vec<Effect>) {
        if let Some(open) = self.open.as_mut() {
            open.timer = None;
        }
        match timer.purpose {
            TimerPurpose::ConfirmStationary => {
                if let Some(since) = self.detector.stationary_since() {
                    self.enter_pending_end(since, timer.deadline, effects);
                }
            }
            TimerPurpose::GraceExpiry => {
                let end = self
                    .open
                    .as_ref()
                    .and_then(|open| open.stationary_start)
                    .unwrap_or(timer.deadline);
                info!(
                    "Grace period expired for trip {}",
                    self.open_trip_id().unwrap_or("?")
                );
                self.complete(end, TripTrigger::Stationary, timer.deadline, effects);
            }
        }
    }

    fn check_inactivity(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if !self.settings.trip_detection_enabled || self.state != TripState::Active {
            return;
        }
        let Some(open) = self.open.as_ref() else {
            return;
        };
        if open.timer.is_some() {
            return;
        }
        if now - open.last_input_at >= self.settings.stationary_threshold() {
            let end = open.last_input_at;
            info!(
                "Trip {} received no input since {}; closing on inactivity",
                open.trip.id, end
            );
            self.complete(end, TripTrigger::Time, now, effects);
        }
    }

    fn on_mode(&mut self, state: &TransportationState, effects: &mut Vec<Effect>) {
        let observation = self.detector.observe_mode(state);
        if observation == Observation::Ignored {
            debug!(
                "Ignoring {} update at {} (confidence {:.2})",
                state.mode.as_str(),
                state.timestamp,
                state.confidence
            );
            return;
        }

        let now = state.timestamp;
        match self.state {
            TripState::Idle | TripState::Completed => {
                if self.settings.trip_detection_enabled {
                    self.try_start(now, effects);
                }
            }
            TripState::Active => self.evaluate_active(now, effects),
            TripState::PendingEnd => {
                if state.mode.is_moving() {
                    self.resume(state.mode, now, effects);
                }
            }
        }
    }

    fn on_location(&mut self, sample: LocationSample, effects: &mut Vec<Effect>) {
        let idle = self.open.is_none();
        let usable = self.detector.observe_location(&sample, idle);
        let now = sample.timestamp;
        let checkpoint_every = self.detector.config().checkpoint_every_locations;

        match self.open.as_mut() {
            None => {
                if usable {
                    effects.push(Effect::LocationAccepted {
                        sample,
                        trip_id: None,
                    });
                }
                if self.settings.trip_detection_enabled {
                    self.try_start(now, effects);
                }
            }
            Some(open) => {
                if usable {
                    if self.state == TripState::Active {
                        if let Some(previous) = open.last_location.as_ref() {
                            open.trip.total_distance_meters += previous.distance_to(&sample);
                        }
                        open.trip.location_count += 1;
                    }
                    open.last_location = Some(sample.clone());
                    effects.push(Effect::LocationAccepted {
                        sample,
                        trip_id: Some(open.trip.id.clone()),
                    });

                    open.locations_since_checkpoint += 1;
                    if open.locations_since_checkpoint >= checkpoint_every {
                        open.locations_since_checkpoint = 0;
                        effects.push(Effect::Checkpoint);
                    }
                }
                if self.state == TripState::Active {
                    self.evaluate_active(now, effects);
                }
            }
        }
    }

    fn try_start(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        // A settled stop re-establishes rest, whatever the last trip ended with.
        if self.detector.stationary_settled(now).is_some() {
            self.detector.accept_candidate();
        }
        if let Some(decision) = self.detector.evaluate_start(now) {
            self.open_new_trip(decision, now, effects);
        }
    }

    /// Stationary edges, flicker cancellation and in-trip mode switches.
    fn evaluate_active(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let Some(open) = self.open.as_ref() else {
            return;
        };
        let current_mode = open.tracker.current_mode();
        let confirm_armed = open
            .timer
            .map(|timer| timer.purpose == TimerPurpose::ConfirmStationary)
            .unwrap_or(false);

        if let Some(since) = self.detector.stationary_since() {
            if self.detector.stationary_settled(now).is_some() {
                if self.settings.trip_detection_enabled {
                    self.enter_pending_end(since, now, effects);
                } else {
                    self.switch_segment(TransportationMode::Stationary, since, effects);
                }
            } else if !confirm_armed && self.settings.trip_detection_enabled {
                let deadline = since + self.detector.config().min_transition();
                self.arm(TimerPurpose::ConfirmStationary, deadline, effects);
            }
            return;
        }

        if confirm_armed {
            debug!("Stationary flicker ended before confirmation");
            self.disarm(effects);
        }

        if let Some(candidate) = self.detector.evaluate_switch(current_mode, now) {
            self.switch_segment(candidate.mode, candidate.first_seen, effects);
        }
    }

    fn switch_segment(
        &mut self,
        mode: TransportationMode,
        at: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        self.detector.accept_candidate();
        if let Some(open) = self.open.as_mut() {
            if open.tracker.transition(mode, at) {
                if mode.is_moving() {
                    open.last_moving_mode = mode;
                }
                effects.push(Effect::Checkpoint);
            }
        }
    }

    fn open_new_trip(
        &mut self,
        decision: StartDecision,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        if self.open.is_some() {
            return;
        }

        let distance = decision.distance_meters();
        let id = Uuid::new_v4().to_string();
        let trip = Trip {
            id: id.clone(),
            state: TripState::Active,
            start_time: decision.start_time,
            end_time: None,
            start_location: decision.start_location.clone(),
            end_location: None,
            total_distance_meters: distance,
            location_count: decision.locations.len() as u64,
            dominant_mode: decision.mode,
            modes_used: [decision.mode].into_iter().collect(),
            mode_breakdown: Default::default(),
            start_trigger: decision.trigger,
            end_trigger: None,
            segments: Vec::new(),
            synced: false,
            created_at: now,
            updated_at: now,
        };

        self.open = Some(OpenTrip {
            trip,
            tracker: ModeSegmentTracker::new(decision.mode, decision.start_time),
            last_location: decision
                .locations
                .last()
                .cloned()
                .or_else(|| decision.start_location.clone()),
            stationary_start: None,
            stationary_location: None,
            last_moving_mode: decision.mode,
            timer: None,
            last_input_at: now,
            locations_since_checkpoint: 0,
        });
        self.detector.begin_trip(decision.mode);
        self.state = TripState::Active;

        info!(
            "Trip {} started at {} ({}, {})",
            id,
            decision.start_time,
            decision.trigger.as_str(),
            decision.mode.as_str()
        );
        effects.push(Effect::StateChanged(TripState::Active));
        effects.push(Effect::Checkpoint);
    }

    fn enter_pending_end(
        &mut self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        self.detector.accept_candidate();
        self.disarm(effects);

        let Some(open) = self.open.as_mut() else {
            return;
        };
        let since = since.max(open.tracker.current_start());
        let previous = open.tracker.current_mode();
        if previous.is_moving() {
            open.last_moving_mode = previous;
        }
        open.tracker.transition(TransportationMode::Stationary, since);
        open.stationary_start = Some(since);
        open.stationary_location = open.last_location.clone();
        open.trip.state = TripState::PendingEnd;
        let deadline = since + grace_period_for(open.last_moving_mode, &self.settings);
        let trip_id = open.trip.id.clone();

        self.state = TripState::PendingEnd;
        effects.push(Effect::StateChanged(TripState::PendingEnd));
        info!(
            "Trip {} stationary since {}; grace period until {}",
            trip_id, since, deadline
        );

        if deadline <= now {
            self.complete(since, TripTrigger::Stationary, now, effects);
            return;
        }
        self.arm(TimerPurpose::GraceExpiry, deadline, effects);
        effects.push(Effect::Checkpoint);
    }

    fn resume(&mut self, mode: TransportationMode, at: DateTime<Utc>, effects: &mut Vec<Effect>) {
        self.disarm(effects);
        self.detector.force_mode(mode);

        let Some(open) = self.open.as_mut() else {
            return;
        };
        open.tracker.transition(mode, at);
        open.last_moving_mode = mode;
        open.stationary_start = None;
        open.stationary_location = None;
        open.trip.state = TripState::Active;

        info!("Trip {} resumed ({}) at {}", open.trip.id, mode.as_str(), at);
        self.state = TripState::Active;
        effects.push(Effect::StateChanged(TripState::Active));
        effects.push(Effect::Checkpoint);
    }

    fn force_start(&mut self, at: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), EngineError> {
        if let Some(open) = self.open.as_ref() {
            return Err(EngineError::TripAlreadyOpen(open.trip.id.clone()));
        }

        let mode = self
            .detector
            .candidate()
            .map(|candidate| candidate.mode)
            .filter(|mode| mode.is_moving())
            .or_else(|| Some(self.detector.confirmed_mode()).filter(|mode| mode.is_moving()))
            .unwrap_or(TransportationMode::Unknown);

        let decision = StartDecision {
            trigger: TripTrigger::Manual,
            mode,
            start_time: at,
            start_location: self.detector.last_known_location().cloned(),
            locations: Vec::new(),
        };
        self.open_new_trip(decision, at, effects);
        Ok(())
    }

    fn force_end(&mut self, at: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), EngineError> {
        let Some(open) = self.open.as_ref() else {
            return Err(EngineError::NoOpenTrip);
        };
        let end = open
            .stationary_start
            .unwrap_or_else(|| at.max(open.tracker.current_start()));
        self.complete(end, TripTrigger::Manual, at, effects);
        Ok(())
    }

    fn complete(
        &mut self,
        end: DateTime<Utc>,
        trigger: TripTrigger,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(open) = self.open.take() else {
            return;
        };
        if let Some(timer) = open.timer {
            effects.push(Effect::CancelTimer(timer.generation));
        }

        let mut trip = open.trip;
        let end = end.max(trip.start_time);
        trip.segments = open.tracker.finish(end);
        apply_summary(&mut trip);
        trip.state = TripState::Completed;
        trip.end_time = Some(end);
        trip.end_trigger = Some(trigger);
        trip.end_location = open.stationary_location.or(open.last_location);
        trip.updated_at = now.max(trip.updated_at);

        info!(
            "Trip {} completed ({}): {} -> {}, {:.0} m",
            trip.id,
            trigger.as_str(),
            trip.start_time,
            end,
            trip.total_distance_meters
        );

        let resting_mode = match trigger {
            TripTrigger::Stationary | TripTrigger::Time => TransportationMode::Stationary,
            _ => self.detector.confirmed_mode(),
        };
        self.detector.end_trip(trip.end_location.clone(), resting_mode);

        self.state = TripState::Completed;
        effects.push(Effect::StateChanged(TripState::Completed));
        effects.push(Effect::TripCompleted(trip));
        self.state = TripState::Idle;
        effects.push(Effect::StateChanged(TripState::Idle));
    }
}
