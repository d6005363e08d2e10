//! The trip engine: a single-writer actor around [`TripStateMachine`].
//!
//! Mode updates, location samples, manual controls and timer expiries are serialized through
//! one queue and applied in order. Effects produced by the state machine are carried out
//! here: timers are armed on the [`GracePeriodManager`], writes go through a retry queue so a
//! failing database never rolls back in-memory state, and the current state is published on
//! `watch` channels.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::detection::DetectionConfig;
use crate::error::EngineError;
use crate::matching::{spawn_map_matching, MapMatcher};
use crate::models::{LocationSample, TransportationState, Trip, TripState, TripWithLocations};
use crate::movement::{
    spawn_recorder, MovementEventRecorder, NoTelemetry, RecorderCommand, RecorderHandle,
    TelemetryProvider,
};
use crate::settings::TripSettings;

use super::backfill::backfill_trips;
use super::finalizer::{FinalizeOutcome, TripFinalizer};
use super::grace::{GracePeriodManager, PendingTimer};
use super::state::{Effect, EngineInput, TripStateMachine};
use super::writes::{PendingWrite, WriteQueue};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const OUTCOME_CHANNEL_CAPACITY: usize = 64;
const WALL_CLOCK_TICK: Duration = Duration::from_secs(30);
const LOCATION_FAILURES_PER_PASS: u32 = 2;

/// Where timer deadlines are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Deadlines also fire on the wall clock through the grace period manager.
    #[default]
    WallClock,
    /// Deadlines fire only when a later input reaches them. Used to replay recorded streams.
    EventTime,
}

pub struct EngineOptions {
    pub settings: TripSettings,
    pub detection: DetectionConfig,
    pub clock: ClockSource,
    pub telemetry: Arc<dyn TelemetryProvider>,
    pub map_matcher: Option<Arc<dyn MapMatcher>>,
}

impl EngineOptions {
    pub fn new(settings: TripSettings) -> Self {
        Self {
            settings,
            detection: DetectionConfig::default(),
            clock: ClockSource::WallClock,
            telemetry: Arc::new(NoTelemetry),
            map_matcher: None,
        }
    }
}

enum EngineCommand {
    Input(EngineInput),
    ForceStart {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Trip, EngineError>>,
    },
    ForceEnd {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<FinalizeOutcome, EngineError>>,
    },
    UpdateSettings(TripSettings),
    Flush(oneshot::Sender<Result<(), EngineError>>),
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct TripEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    recorder: RecorderHandle,
    db: Database,
    state_rx: watch::Receiver<TripState>,
    trip_rx: watch::Receiver<Option<Trip>>,
    settings_rx: watch::Receiver<TripSettings>,
    outcomes: broadcast::Sender<FinalizeOutcome>,
    cancel_token: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TripEngine {
    /// Restore any checkpointed trip and start the engine and recorder tasks.
    pub async fn start(db: Database, options: EngineOptions) -> anyhow::Result<Self> {
        let settings = options.settings.clamped();
        let mut machine = TripStateMachine::new(settings.clone(), options.detection.clone());

        let checkpoint = match db.load_checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                log_warn!("ignoring unreadable open trip checkpoint: {err:?}");
                None
            }
        };
        let last_completed = db.get_latest_completed_trip().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TripState::Idle);
        let (trip_tx, trip_rx) = watch::channel(None);
        let (trip_id_tx, trip_id_rx) = watch::channel(None);
        let (settings_tx, settings_rx) = watch::channel(settings.clone());
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let restore_effects = checkpoint
            .map(|checkpoint| machine.restore(checkpoint, Utc::now()))
            .unwrap_or_default();

        let mut worker = EngineWorker {
            finalizer: TripFinalizer::from_settings(&settings),
            machine,
            db: db.clone(),
            grace: GracePeriodManager::new(),
            clock: options.clock,
            timer_tx,
            state_tx,
            trip_tx,
            trip_id_tx,
            settings_tx,
            outcomes: outcomes.clone(),
            map_matcher: options.map_matcher,
            last_completed,
            pending: WriteQueue::default(),
            last_write_error: None,
        };
        worker.process(restore_effects).await;
        worker.publish();

        let recorder = MovementEventRecorder::new(
            options.telemetry,
            Duration::from_millis(options.detection.telemetry_timeout_ms),
        );
        let (recorder_handle, recorder_task) =
            spawn_recorder(recorder, db.clone(), trip_id_rx, cancel_token.clone());

        let worker_task = tokio::spawn(worker.run(command_rx, timer_rx, cancel_token.clone()));

        log_info!("Trip engine started ({:?})", options.clock);

        Ok(Self {
            commands: command_tx,
            recorder: recorder_handle,
            db,
            state_rx,
            trip_rx,
            settings_rx,
            outcomes,
            cancel_token,
            tasks: Arc::new(Mutex::new(vec![worker_task, recorder_task])),
        })
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::EngineStopped)
    }

    pub fn submit_mode(&self, state: TransportationState) -> Result<(), EngineError> {
        if let Err(err) = self.recorder.send(RecorderCommand::Mode(state.clone())) {
            log_warn!("movement recorder unavailable: {err}");
        }
        self.send(EngineCommand::Input(EngineInput::Mode(state)))
    }

    pub fn submit_location(&self, sample: LocationSample) -> Result<(), EngineError> {
        if let Err(err) = self.recorder.send(RecorderCommand::Location(sample.clone())) {
            log_warn!("movement recorder unavailable: {err}");
        }
        self.send(EngineCommand::Input(EngineInput::Location(sample)))
    }

    /// Open a manual trip now. Fails with [`EngineError::TripAlreadyOpen`] if one is open.
    pub async fn force_start_trip(&self) -> Result<Trip, EngineError> {
        self.force_start_trip_at(Utc::now()).await
    }

    pub async fn force_start_trip_at(&self, at: DateTime<Utc>) -> Result<Trip, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineCommand::ForceStart { at, reply })?;
        reply_rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// Close the open trip now and run it through the finalizer.
    pub async fn force_end_trip(&self) -> Result<FinalizeOutcome, EngineError> {
        self.force_end_trip_at(Utc::now()).await
    }

    pub async fn force_end_trip_at(
        &self,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineCommand::ForceEnd { at, reply })?;
        reply_rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub fn update_settings(&self, settings: TripSettings) -> Result<(), EngineError> {
        self.send(EngineCommand::UpdateSettings(settings))
    }

    pub fn settings(&self) -> TripSettings {
        self.settings_rx.borrow().clone()
    }

    /// Resolves once every input submitted before the call has been applied and its writes
    /// attempted. Reports writes still waiting for retry as a persistence failure.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Flush(reply))?;
        let result = reply_rx.await.map_err(|_| EngineError::EngineStopped)?;
        if let Err(err) = self.recorder.flush().await {
            log_warn!("movement recorder flush failed: {err}");
        }
        result
    }

    pub fn current_trip_state(&self) -> watch::Receiver<TripState> {
        self.state_rx.clone()
    }

    pub fn active_trip(&self) -> watch::Receiver<Option<Trip>> {
        self.trip_rx.clone()
    }

    /// Finalization results, including discarded trips.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FinalizeOutcome> {
        self.outcomes.subscribe()
    }

    pub async fn get_trip_by_id(&self, trip_id: &str) -> Result<Option<Trip>, EngineError> {
        self.db
            .get_trip_by_id(trip_id)
            .await
            .map_err(|err| EngineError::persistence("trip lookup", &err))
    }

    pub async fn get_trips_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trip>, EngineError> {
        self.db
            .get_trips_in_range(start, end)
            .await
            .map_err(|err| EngineError::persistence("trip range query", &err))
    }

    pub async fn get_recent_trips(&self, limit: u32) -> Result<Vec<Trip>, EngineError> {
        self.db
            .get_recent_trips(limit)
            .await
            .map_err(|err| EngineError::persistence("recent trips query", &err))
    }

    pub async fn get_trip_with_locations(
        &self,
        trip_id: &str,
    ) -> Result<Option<TripWithLocations>, EngineError> {
        self.db
            .get_trip_with_locations(trip_id)
            .await
            .map_err(|err| EngineError::persistence("trip locations query", &err))
    }

    pub async fn get_unsynced_trips(&self) -> Result<Vec<Trip>, EngineError> {
        self.db
            .get_unsynced_trips()
            .await
            .map_err(|err| EngineError::persistence("unsynced trips query", &err))
    }

    pub async fn mark_trip_synced(&self, trip_id: &str) -> Result<bool, EngineError> {
        self.db
            .mark_trip_synced(trip_id)
            .await
            .map_err(|err| EngineError::persistence("sync acknowledgement", &err))
    }

    /// Rebuild trips from recorded movement events and location history in `[start, end]`.
    /// Trips overlapping ones already stored are skipped. Returns the trips persisted.
    pub async fn backfill_trips_from_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trip>, EngineError> {
        let load = async {
            let events = self.db.get_movement_events_in_range(start, end).await?;
            let locations = self.db.get_locations_in_range(start, end).await?;
            let existing = self.db.get_trips_in_range(start, end).await?;
            anyhow::Ok((events, locations, existing))
        };
        let (events, locations, existing) = load
            .await
            .map_err(|err| EngineError::persistence("backfill history", &err))?;

        let trips = backfill_trips(&self.settings(), &events, &locations, end, &existing);
        for trip in &trips {
            self.db
                .upsert_trip(trip)
                .await
                .map_err(|err| EngineError::persistence(format!("trip {}", trip.id), &err))?;
            let end_time = trip.end_time.unwrap_or(trip.updated_at);
            if let Err(err) = self
                .db
                .assign_locations_to_trip(trip.start_time, end_time, &trip.id)
                .await
            {
                log_warn!("failed to tag history for backfilled trip {}: {err:?}", trip.id);
            }
        }

        log_info!(
            "Backfill {} -> {}: {} trips from {} events and {} locations",
            start,
            end,
            trips.len(),
            events.len(),
            locations.len()
        );
        Ok(trips)
    }

    /// Apply everything queued, then stop the engine and recorder tasks.
    pub async fn shutdown(&self) {
        if let Err(err) = self.flush().await {
            log_warn!("shutting down with unpersisted writes: {err}");
        }
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                log_error!("engine task failed during shutdown: {err}");
            }
        }
        log_info!("Trip engine stopped");
    }
}

struct EngineWorker {
    machine: TripStateMachine,
    finalizer: TripFinalizer,
    db: Database,
    grace: GracePeriodManager,
    clock: ClockSource,
    timer_tx: mpsc::UnboundedSender<PendingTimer>,
    state_tx: watch::Sender<TripState>,
    trip_tx: watch::Sender<Option<Trip>>,
    trip_id_tx: watch::Sender<Option<String>>,
    settings_tx: watch::Sender<TripSettings>,
    outcomes: broadcast::Sender<FinalizeOutcome>,
    map_matcher: Option<Arc<dyn MapMatcher>>,
    /// Merge candidate for the next completed trip.
    last_completed: Option<Trip>,
    pending: WriteQueue,
    last_write_error: Option<EngineError>,
}

impl EngineWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut timers: mpsc::UnboundedReceiver<PendingTimer>,
        cancel_token: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(WALL_CLOCK_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        let wall_clock = self.clock == ClockSource::WallClock;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                Some(timer) = timers.recv() => {
                    self.apply(EngineInput::TimerFired(timer)).await;
                }
                _ = tick.tick(), if wall_clock => {
                    // Closes trips whose input stream went quiet.
                    let mut effects = Vec::new();
                    self.machine.advance(Utc::now(), &mut effects);
                    if !effects.is_empty() {
                        self.process(effects).await;
                        self.publish();
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        self.grace.cancel_all();
        self.drain_pending().await;
        if !self.pending.is_empty() {
            log_error!(
                "{} writes still pending at shutdown; the open trip checkpoint may be stale",
                self.pending.len()
            );
        }
        log_info!("trip engine worker shutting down");
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Input(input) => {
                self.apply(input).await;
            }
            EngineCommand::ForceStart { at, reply } => {
                let result = match self.machine.apply(EngineInput::ForceStart { at }) {
                    Ok(effects) => {
                        self.process(effects).await;
                        self.machine.active_trip().ok_or(EngineError::NoOpenTrip)
                    }
                    Err(err) => Err(err),
                };
                self.publish();
                let _ = reply.send(result);
            }
            EngineCommand::ForceEnd { at, reply } => {
                let result = match self.machine.apply(EngineInput::ForceEnd { at }) {
                    Ok(effects) => self
                        .process(effects)
                        .await
                        .into_iter()
                        .next()
                        .ok_or(EngineError::NoOpenTrip),
                    Err(err) => Err(err),
                };
                self.publish();
                let _ = reply.send(result);
            }
            EngineCommand::UpdateSettings(settings) => {
                self.machine.update_settings(settings);
                let applied = self.machine.settings().clone();
                self.finalizer = TripFinalizer::from_settings(&applied);
                self.settings_tx.send_replace(applied);
                log_info!("Trip settings updated");
            }
            EngineCommand::Flush(reply) => {
                self.drain_pending().await;
                let result = if self.pending.is_empty() {
                    Ok(())
                } else {
                    Err(EngineError::PersistenceFailure {
                        what: format!("{} queued writes", self.pending.len()),
                        reason: self
                            .last_write_error
                            .as_ref()
                            .map(|err| err.to_string())
                            .unwrap_or_default(),
                    })
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn apply(&mut self, input: EngineInput) -> Vec<FinalizeOutcome> {
        let outcomes = match self.machine.apply(input) {
            Ok(effects) => self.process(effects).await,
            Err(err) => {
                log_warn!("rejected input: {err}");
                Vec::new()
            }
        };
        self.publish();
        outcomes
    }

    /// Carry out effects in order, then attempt every queued write.
    async fn process(&mut self, effects: Vec<Effect>) -> Vec<FinalizeOutcome> {
        let mut outcomes = Vec::new();

        for effect in effects {
            match effect {
                Effect::StateChanged(state) => {
                    self.state_tx.send_replace(state);
                }
                Effect::ArmTimer(timer) => self.arm(timer),
                Effect::CancelTimer(generation) => {
                    if let Err(err) = self.grace.cancel_generation(generation) {
                        log_debug!("{err}");
                    }
                }
                Effect::LocationAccepted { sample, trip_id } => {
                    self.pending.push(PendingWrite::Location { sample, trip_id });
                }
                Effect::Checkpoint => {
                    if let Some(checkpoint) = self.machine.checkpoint() {
                        self.pending.push(PendingWrite::Checkpoint(checkpoint));
                    }
                }
                Effect::TripCompleted(trip) => {
                    outcomes.push(self.finalize(trip));
                }
            }
        }

        self.drain_pending().await;
        outcomes
    }

    fn arm(&mut self, timer: PendingTimer) {
        if self.clock == ClockSource::EventTime {
            return;
        }
        let timer_tx = self.timer_tx.clone();
        self.grace.arm(timer, move |fired| {
            let _ = timer_tx.send(fired);
        });
    }

    fn finalize(&mut self, trip: Trip) -> FinalizeOutcome {
        let outcome = self.finalizer.finalize(trip, self.last_completed.as_ref());

        match &outcome {
            FinalizeOutcome::Persisted(trip) => {
                self.pending.push(PendingWrite::Trip(trip.clone()));
                self.last_completed = Some(trip.clone());
            }
            FinalizeOutcome::Merged {
                merged,
                absorbed_id,
            } => {
                self.pending.push(PendingWrite::Trip(merged.clone()));
                self.pending.push(PendingWrite::Reassign {
                    from: absorbed_id.clone(),
                    to: Some(merged.id.clone()),
                });
                self.last_completed = Some(merged.clone());
            }
            FinalizeOutcome::Discarded { trip, .. } => {
                self.pending.push(PendingWrite::Reassign {
                    from: trip.id.clone(),
                    to: None,
                });
            }
        }
        self.pending.push(PendingWrite::ClearCheckpoint);

        let _ = self.outcomes.send(outcome.clone());
        outcome
    }

    fn publish(&self) {
        self.state_tx.send_if_modified(|state| {
            let current = self.machine.state();
            let changed = *state != current;
            *state = current;
            changed
        });
        self.trip_tx.send_replace(self.machine.active_trip());
        let open_id = self.machine.open_trip_id().map(str::to_string);
        self.trip_id_tx.send_if_modified(|id| {
            let changed = *id != open_id;
            *id = open_id;
            changed
        });
    }

    /// Attempt queued writes in order. A failed location sample stays queued and is skipped;
    /// after two location failures in a row the remaining samples wait for the next pass.
    /// Any other failure ends the pass.
    async fn drain_pending(&mut self) {
        let mut index = 0;
        let mut location_failures = 0;
        while let Some(write) = self.pending.get(index) {
            let is_location = write.is_location();
            if is_location && location_failures >= LOCATION_FAILURES_PER_PASS {
                index += 1;
                continue;
            }
            match self.write(write).await {
                Ok(()) => {
                    if is_location {
                        location_failures = 0;
                    }
                    if let Some(done) = self.pending.remove(index) {
                        self.after_write(done);
                    }
                }
                Err(err) => {
                    log_warn!("{err}; {} writes queued for retry", self.pending.len());
                    self.last_write_error = Some(err);
                    if !is_location {
                        break;
                    }
                    location_failures += 1;
                    index += 1;
                }
            }
        }
        if self.pending.is_empty() {
            self.last_write_error = None;
        }
    }

    async fn write(&self, write: &PendingWrite) -> Result<(), EngineError> {
        let result = match write {
            PendingWrite::Location { sample, trip_id } => {
                self.db.insert_location(sample, trip_id.as_deref()).await
            }
            PendingWrite::Checkpoint(checkpoint) => self.db.save_checkpoint(checkpoint).await,
            PendingWrite::ClearCheckpoint => self.db.clear_checkpoint().await,
            PendingWrite::Trip(trip) => self.db.upsert_trip(trip).await,
            PendingWrite::Reassign { from, to } => {
                self.db.reassign_trip_references(from, to.as_deref()).await
            }
        };
        result.map_err(|err| EngineError::persistence(write.describe(), &err))
    }

    fn after_write(&mut self, write: PendingWrite) {
        match write {
            PendingWrite::Trip(trip) => self.after_trip_saved(trip),
            PendingWrite::Reassign { from, to } => {
                self.pending.retag_locations(&from, to.as_deref());
            }
            _ => {}
        }
    }

    fn after_trip_saved(&self, trip: Trip) {
        log_info!(
            "Saved trip {} ({}, {:.0} m)",
            trip.id,
            trip.dominant_mode.as_str(),
            trip.total_distance_meters
        );
        if let Some(matcher) = &self.map_matcher {
            spawn_map_matching(self.db.clone(), matcher.clone(), trip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DetectionSource, MovementEvent, TransportationMode, TripTrigger,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn replay_options() -> EngineOptions {
        EngineOptions {
            clock: ClockSource::EventTime,
            ..EngineOptions::new(TripSettings::default())
        }
    }

    fn mode_at(mode: TransportationMode, at: DateTime<Utc>) -> TransportationState {
        TransportationState::new(mode, 0.9, at)
    }

    fn north(meters: f64, at: DateTime<Utc>) -> LocationSample {
        LocationSample::new(52.0 + meters / 111_195.0, 13.0, 5.0, at)
    }

    /// Drive north for ten minutes from `origin`; the trip starts at `origin + 10 s`.
    fn drive(engine: &TripEngine, origin: DateTime<Utc>) -> f64 {
        let at = |secs: i64| origin + ChronoDuration::seconds(secs);
        engine
            .submit_mode(mode_at(TransportationMode::Stationary, at(0)))
            .unwrap();
        engine.submit_location(north(0.0, at(0))).unwrap();
        engine
            .submit_mode(mode_at(TransportationMode::InVehicle, at(10)))
            .unwrap();
        engine.submit_location(north(15.0, at(20))).unwrap();
        engine
            .submit_mode(mode_at(TransportationMode::InVehicle, at(40)))
            .unwrap();

        let mut meters = 15.0;
        for secs in (60..=600).step_by(30) {
            meters += 300.0;
            engine.submit_location(north(meters, at(secs))).unwrap();
            engine
                .submit_mode(mode_at(TransportationMode::InVehicle, at(secs)))
                .unwrap();
        }
        meters
    }

    /// Park at `meters` from `origin + 620 s` and stay long enough for the grace period.
    fn park(engine: &TripEngine, origin: DateTime<Utc>, meters: f64) {
        let at = |secs: i64| origin + ChronoDuration::seconds(secs);
        for secs in [620, 650, 680, 710, 740] {
            engine
                .submit_mode(mode_at(TransportationMode::Stationary, at(secs)))
                .unwrap();
            engine.submit_location(north(meters, at(secs))).unwrap();
        }
    }

    #[tokio::test]
    async fn completed_trip_is_persisted_with_its_history() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();
        let mut outcomes = engine.subscribe_outcomes();

        let meters = drive(&engine, t(0));
        engine.flush().await.unwrap();
        assert_eq!(*engine.current_trip_state().borrow(), TripState::Active);
        let active = engine.active_trip().borrow().clone().unwrap();
        assert_eq!(active.start_time, t(10));
        assert!(db.load_checkpoint().await.unwrap().is_some());

        park(&engine, t(0), meters);
        engine.flush().await.unwrap();

        let trip = match outcomes.recv().await.unwrap() {
            FinalizeOutcome::Persisted(trip) => trip,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(trip.id, active.id);
        assert_eq!(trip.end_time, Some(t(620)));
        assert_eq!(trip.end_trigger, Some(TripTrigger::Stationary));
        assert_eq!(*engine.current_trip_state().borrow(), TripState::Idle);
        assert!(engine.active_trip().borrow().is_none());

        let stored = engine.get_trip_by_id(&trip.id).await.unwrap().unwrap();
        assert_eq!(stored, trip);
        assert!(db.load_checkpoint().await.unwrap().is_none());

        let with_locations = engine.get_trip_with_locations(&trip.id).await.unwrap().unwrap();
        assert!(with_locations.locations.len() >= 19);

        let events = db.get_movement_events_in_range(t(0), t(1000)).await.unwrap();
        let changes: Vec<TransportationMode> = events.iter().map(|e| e.new_mode).collect();
        assert_eq!(
            changes,
            vec![
                TransportationMode::Stationary,
                TransportationMode::InVehicle,
                TransportationMode::Stationary
            ]
        );

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn short_hop_is_discarded_and_detached_from_history() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();

        engine.force_start_trip_at(t(0)).await.unwrap();
        engine.submit_location(north(0.0, t(10))).unwrap();
        engine.submit_location(north(40.0, t(60))).unwrap();
        let outcome = engine.force_end_trip_at(t(90)).await.unwrap();

        let trip_id = match outcome {
            FinalizeOutcome::Discarded { trip, .. } => trip.id,
            other => panic!("unexpected {other:?}"),
        };
        engine.flush().await.unwrap();
        assert!(engine.get_trip_by_id(&trip_id).await.unwrap().is_none());
        assert!(db.get_locations_for_trip(&trip_id).await.unwrap().is_empty());
        assert_eq!(db.get_locations_in_range(t(0), t(100)).await.unwrap().len(), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn manual_controls_report_conflicts() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db, replay_options()).await.unwrap();

        assert!(matches!(
            engine.force_end_trip_at(t(0)).await,
            Err(EngineError::NoOpenTrip)
        ));
        let trip = engine.force_start_trip_at(t(0)).await.unwrap();
        assert_eq!(trip.start_trigger, TripTrigger::Manual);
        assert!(matches!(
            engine.force_start_trip_at(t(5)).await,
            Err(EngineError::TripAlreadyOpen(id)) if id == trip.id
        ));

        engine.shutdown().await;
        assert!(matches!(
            engine.submit_location(north(0.0, t(10))),
            Err(EngineError::EngineStopped)
        ));
    }

    #[tokio::test]
    async fn open_trip_survives_a_restart() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();
        let meters = drive(&engine, t(0));
        engine
            .submit_mode(mode_at(TransportationMode::Stationary, t(620)))
            .unwrap();
        engine.submit_location(north(meters, t(650))).unwrap();
        engine.flush().await.unwrap();
        assert_eq!(*engine.current_trip_state().borrow(), TripState::PendingEnd);
        let open_id = engine.active_trip().borrow().clone().unwrap().id;
        engine.shutdown().await;

        // The grace deadline passed long ago, so recovery completes the trip at once.
        let restarted = TripEngine::start(db.clone(), replay_options()).await.unwrap();
        restarted.flush().await.unwrap();
        assert_eq!(*restarted.current_trip_state().borrow(), TripState::Idle);
        let stored = restarted.get_trip_by_id(&open_id).await.unwrap().unwrap();
        assert_eq!(stored.end_time, Some(t(620)));
        assert!(db.load_checkpoint().await.unwrap().is_none());
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn wall_clock_timers_complete_the_trip() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db, EngineOptions::new(TripSettings::default()))
            .await
            .unwrap();
        let mut outcomes = engine.subscribe_outcomes();

        // Timestamps in the past make every deadline due immediately.
        let origin = Utc::now() - ChronoDuration::minutes(30);
        let meters = drive(&engine, origin);
        engine
            .submit_mode(mode_at(
                TransportationMode::Stationary,
                origin + ChronoDuration::seconds(620),
            ))
            .unwrap();
        engine
            .submit_location(north(meters, origin + ChronoDuration::seconds(625)))
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            FinalizeOutcome::Persisted(trip) => {
                assert_eq!(trip.end_time, Some(origin + ChronoDuration::seconds(620)));
                assert_eq!(trip.end_trigger, Some(TripTrigger::Stationary));
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn consecutive_trips_with_a_short_gap_are_merged() {
        let settings = TripSettings {
            walking_grace_seconds: 30,
            merge_window_seconds: 120,
            ..TripSettings::default()
        };
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(
            db,
            EngineOptions {
                clock: ClockSource::EventTime,
                ..EngineOptions::new(settings)
            },
        )
        .await
        .unwrap();

        engine.force_start_trip_at(t(0)).await.unwrap();
        for (i, secs) in (10..=600).step_by(30).enumerate() {
            engine
                .submit_location(north(i as f64 * 100.0, t(secs)))
                .unwrap();
        }
        let first = match engine.force_end_trip_at(t(600)).await.unwrap() {
            FinalizeOutcome::Persisted(trip) => trip,
            other => panic!("unexpected {other:?}"),
        };

        engine.force_start_trip_at(t(640)).await.unwrap();
        for (i, secs) in (650..=1200).step_by(30).enumerate() {
            engine
                .submit_location(north(5_000.0 + i as f64 * 100.0, t(secs)))
                .unwrap();
        }
        match engine.force_end_trip_at(t(1200)).await.unwrap() {
            FinalizeOutcome::Merged {
                merged,
                absorbed_id,
            } => {
                assert_eq!(merged.id, first.id);
                assert_ne!(absorbed_id, first.id);
                assert_eq!(merged.end_time, Some(t(1200)));
                assert!(merged
                    .segments
                    .iter()
                    .any(|segment| segment.mode == TransportationMode::Stationary));
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.flush().await.unwrap();
        assert_eq!(engine.get_recent_trips(10).await.unwrap().len(), 1);
        engine.shutdown().await;
    }

    async fn set_read_only(db: &Database, read_only: bool) {
        let pragma = if read_only {
            "PRAGMA query_only = ON"
        } else {
            "PRAGMA query_only = OFF"
        };
        db.execute(move |conn| {
            conn.execute_batch(pragma)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failed_writes_keep_state_and_are_retried() {
        let db = Database::in_memory().unwrap();
        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();

        let started = engine.force_start_trip_at(t(0)).await.unwrap();
        for (meters, secs) in [(0.0, 10), (100.0, 60), (200.0, 120)] {
            engine.submit_location(north(meters, t(secs))).unwrap();
        }
        engine.flush().await.unwrap();
        let before = engine.active_trip().borrow().clone().unwrap();

        set_read_only(&db, true).await;
        engine.submit_location(north(300.0, t(180))).unwrap();
        let err = engine.flush().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert_eq!(*engine.current_trip_state().borrow(), TripState::Active);
        let during = engine.active_trip().borrow().clone().unwrap();
        assert_eq!(during.id, started.id);
        assert_eq!(during.location_count, before.location_count + 1);

        let trip = match engine.force_end_trip_at(t(200)).await.unwrap() {
            FinalizeOutcome::Persisted(trip) => trip,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(*engine.current_trip_state().borrow(), TripState::Idle);
        assert!(engine.flush().await.unwrap_err().is_retryable());
        assert!(engine.get_trip_by_id(&trip.id).await.unwrap().is_none());

        set_read_only(&db, false).await;
        engine.flush().await.unwrap();
        let stored = engine.get_trip_by_id(&trip.id).await.unwrap().unwrap();
        assert_eq!(stored, trip);
        assert!(db.load_checkpoint().await.unwrap().is_none());
        assert_eq!(db.get_locations_for_trip(&trip.id).await.unwrap().len(), 4);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_location_does_not_hold_back_the_trip() {
        let db = Database::in_memory().unwrap();
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_coarse_fix BEFORE INSERT ON location_history
                 WHEN NEW.accuracy > 50
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();

        engine.force_start_trip_at(t(0)).await.unwrap();
        let mut coarse = north(100.0, t(60));
        coarse.accuracy = 60.0;
        for sample in [
            north(0.0, t(10)),
            coarse,
            north(200.0, t(120)),
            north(300.0, t(180)),
        ] {
            engine.submit_location(sample).unwrap();
        }
        let trip = match engine.force_end_trip_at(t(200)).await.unwrap() {
            FinalizeOutcome::Persisted(trip) => trip,
            other => panic!("unexpected {other:?}"),
        };

        assert!(engine.flush().await.unwrap_err().is_retryable());
        assert!(engine.get_trip_by_id(&trip.id).await.unwrap().is_some());
        assert!(db.load_checkpoint().await.unwrap().is_none());
        assert_eq!(db.get_locations_for_trip(&trip.id).await.unwrap().len(), 3);

        db.execute(|conn| {
            conn.execute_batch("DROP TRIGGER reject_coarse_fix")?;
            Ok(())
        })
        .await
        .unwrap();
        engine.flush().await.unwrap();
        assert_eq!(db.get_locations_for_trip(&trip.id).await.unwrap().len(), 4);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn history_can_be_backfilled() {
        let db = Database::in_memory().unwrap();
        for (secs, from, to) in [
            (0, TransportationMode::Unknown, TransportationMode::Stationary),
            (100, TransportationMode::Stationary, TransportationMode::Cycling),
            (1300, TransportationMode::Cycling, TransportationMode::Stationary),
        ] {
            db.insert_movement_event(&MovementEvent {
                id: format!("ev-{secs}"),
                timestamp: t(secs),
                trip_id: None,
                previous_mode: from,
                new_mode: to,
                source: DetectionSource::ActivityRecognition,
                confidence: 0.9,
                detection_latency_ms: 0,
                location: None,
                device_state: None,
                sensor_telemetry: None,
            })
            .await
            .unwrap();
        }
        let samples: Vec<LocationSample> = (0..=100)
            .map(|i| {
                let secs = i * 20;
                let moving = (secs.clamp(100, 1300) - 100) as f64;
                north(moving * 5.0, t(secs))
            })
            .collect();
        db.insert_locations(&samples, None).await.unwrap();

        let engine = TripEngine::start(db.clone(), replay_options()).await.unwrap();
        let trips = engine
            .backfill_trips_from_history(t(0), t(2000))
            .await
            .unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].dominant_mode, TransportationMode::Cycling);
        assert!(engine.get_trip_by_id(&trips[0].id).await.unwrap().is_some());
        assert!(!db.get_locations_for_trip(&trips[0].id).await.unwrap().is_empty());

        let again = engine
            .backfill_trips_from_history(t(0), t(2000))
            .await
            .unwrap();
        assert!(again.is_empty());
        engine.shutdown().await;
    }
}
