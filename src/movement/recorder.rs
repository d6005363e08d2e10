//! Movement event recording.
//!
//! Runs beside the trip engine on its own queue: a slow telemetry collector or a failing
//! database delays only movement events, never trip transitions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{LocationSample, MovementEvent, TransportationMode, TransportationState};

use super::telemetry::{collect_with_timeout, TelemetryProvider};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const MAX_PENDING_EVENTS: usize = 1_000;

pub struct MovementEventRecorder {
    telemetry: Arc<dyn TelemetryProvider>,
    telemetry_timeout: Duration,
    last_mode: TransportationMode,
    last_mode_seen_at: Option<DateTime<Utc>>,
    last_location: Option<LocationSample>,
    last_input_at: Option<DateTime<Utc>>,
}

impl MovementEventRecorder {
    pub fn new(telemetry: Arc<dyn TelemetryProvider>, telemetry_timeout: Duration) -> Self {
        Self {
            telemetry,
            telemetry_timeout,
            last_mode: TransportationMode::Unknown,
            last_mode_seen_at: None,
            last_location: None,
            last_input_at: None,
        }
    }

    /// Inputs older than the newest one seen are dropped.
    fn accept_time(&mut self, received: DateTime<Utc>) -> bool {
        if let Some(last_applied) = self.last_input_at {
            if received < last_applied {
                let err = EngineError::InputOutOfOrder {
                    received,
                    last_applied,
                };
                log_warn!("dropping movement input: {err}");
                return false;
            }
        }
        self.last_input_at = Some(received);
        true
    }

    pub fn observe_location(&mut self, sample: &LocationSample) {
        if self.accept_time(sample.timestamp) {
            self.last_location = Some(sample.clone());
        }
    }

    /// Build the event for a raw mode change, without telemetry. Repeats of the current
    /// mode only refresh its last-seen time; out-of-order updates are dropped.
    pub fn detect_change(
        &mut self,
        state: &TransportationState,
        trip_id: Option<String>,
    ) -> Option<MovementEvent> {
        if !self.accept_time(state.timestamp) {
            return None;
        }
        if state.mode == self.last_mode {
            self.last_mode_seen_at = Some(state.timestamp);
            return None;
        }

        let latency_ms = self
            .last_mode_seen_at
            .map(|seen| (state.timestamp - seen).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let event = MovementEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: state.timestamp,
            trip_id,
            previous_mode: self.last_mode,
            new_mode: state.mode,
            source: state.source,
            confidence: state.confidence,
            detection_latency_ms: latency_ms,
            location: self.last_location.clone(),
            device_state: None,
            sensor_telemetry: None,
        };

        self.last_mode = state.mode;
        self.last_mode_seen_at = Some(state.timestamp);
        Some(event)
    }

    /// Detect a change and attach whatever telemetry arrives within the timeout.
    pub async fn record(
        &mut self,
        state: &TransportationState,
        trip_id: Option<String>,
    ) -> Option<MovementEvent> {
        let mut event = self.detect_change(state, trip_id)?;
        match collect_with_timeout(self.telemetry.clone(), self.telemetry_timeout).await {
            Ok(snapshot) => {
                event.sensor_telemetry = snapshot.sensors;
                event.device_state = snapshot.device;
            }
            Err(err) => log_warn!("recording {} without telemetry: {err}", event.id),
        }
        Some(event)
    }
}

pub enum RecorderCommand {
    Mode(TransportationState),
    Location(LocationSample),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct RecorderHandle {
    sender: mpsc::UnboundedSender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn send(&self, command: RecorderCommand) -> Result<(), EngineError> {
        self.sender
            .send(command)
            .map_err(|_| EngineError::EngineStopped)
    }

    /// Resolves once every previously sent command has been processed.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RecorderCommand::Flush(reply_tx))?;
        reply_rx.await.map_err(|_| EngineError::EngineStopped)
    }
}

/// Start the recorder task. `open_trip` carries the id events are tagged with.
pub fn spawn_recorder(
    recorder: MovementEventRecorder,
    db: Database,
    open_trip: watch::Receiver<Option<String>>,
    cancel_token: CancellationToken,
) -> (RecorderHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(recorder_loop(
        recorder,
        db,
        receiver,
        open_trip,
        cancel_token,
    ));
    (RecorderHandle { sender }, task)
}

async fn recorder_loop(
    mut recorder: MovementEventRecorder,
    db: Database,
    mut commands: mpsc::UnboundedReceiver<RecorderCommand>,
    open_trip: watch::Receiver<Option<String>>,
    cancel_token: CancellationToken,
) {
    let mut pending: VecDeque<MovementEvent> = VecDeque::new();

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(RecorderCommand::Mode(state)) => {
                    let trip_id = open_trip.borrow().clone();
                    if let Some(event) = recorder.record(&state, trip_id).await {
                        enqueue(&mut pending, event);
                    }
                    persist_pending(&db, &mut pending).await;
                }
                Some(RecorderCommand::Location(sample)) => recorder.observe_location(&sample),
                Some(RecorderCommand::Flush(reply)) => {
                    persist_pending(&db, &mut pending).await;
                    let _ = reply.send(());
                }
                None => break,
            },
            _ = cancel_token.cancelled() => break,
        }
    }

    persist_pending(&db, &mut pending).await;
    if !pending.is_empty() {
        log_warn!("{} movement events could not be persisted before shutdown", pending.len());
    }
    log_info!("movement recorder shutting down");
}

fn enqueue(pending: &mut VecDeque<MovementEvent>, event: MovementEvent) {
    if pending.len() >= MAX_PENDING_EVENTS {
        if let Some(dropped) = pending.pop_front() {
            log_warn!("dropping unpersisted movement event {}", dropped.id);
        }
    }
    pending.push_back(event);
}

async fn persist_pending(db: &Database, pending: &mut VecDeque<MovementEvent>) {
    while let Some(event) = pending.front() {
        match db.insert_movement_event(event).await {
            Ok(()) => {
                pending.pop_front();
            }
            Err(err) => {
                let err = EngineError::persistence("movement event", &err);
                log_warn!("{err}; {} events queued for retry", pending.len());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectionSource, SensorTelemetry, TelemetrySnapshot};
    use crate::movement::NoTelemetry;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn state(mode: TransportationMode, secs: i64) -> TransportationState {
        TransportationState::new(mode, 0.8, t(secs))
    }

    struct Failing;

    impl crate::movement::TelemetryProvider for Failing {
        fn collect(&self) -> anyhow::Result<TelemetrySnapshot> {
            anyhow::bail!("sensor service unavailable")
        }
    }

    struct Accelerometer;

    impl crate::movement::TelemetryProvider for Accelerometer {
        fn collect(&self) -> anyhow::Result<TelemetrySnapshot> {
            Ok(TelemetrySnapshot {
                sensors: Some(SensorTelemetry {
                    accelerometer_variance: Some(0.4),
                    ..SensorTelemetry::default()
                }),
                device: None,
            })
        }
    }

    #[test]
    fn latency_is_measured_from_the_last_sighting_of_the_previous_mode() {
        let mut recorder = MovementEventRecorder::new(Arc::new(NoTelemetry), Duration::from_secs(2));
        recorder.observe_location(&LocationSample::new(52.0, 13.0, 5.0, t(0)));

        let first = recorder
            .detect_change(&state(TransportationMode::Walking, 0), None)
            .unwrap();
        assert_eq!(first.previous_mode, TransportationMode::Unknown);
        assert_eq!(first.detection_latency_ms, 0);

        assert!(recorder
            .detect_change(&state(TransportationMode::Walking, 40), None)
            .is_none());

        let mut car = state(TransportationMode::InVehicle, 52);
        car.source = DetectionSource::BluetoothCar;
        let second = recorder
            .detect_change(&car, Some("trip-1".into()))
            .unwrap();
        assert_eq!(second.previous_mode, TransportationMode::Walking);
        assert_eq!(second.detection_latency_ms, 12_000);
        assert_eq!(second.source, DetectionSource::BluetoothCar);
        assert_eq!(second.trip_id.as_deref(), Some("trip-1"));
        assert_eq!(second.location.unwrap().timestamp, t(0));
    }

    #[test]
    fn updates_older_than_the_last_input_are_dropped() {
        let mut recorder = MovementEventRecorder::new(Arc::new(NoTelemetry), Duration::from_secs(2));
        assert!(recorder
            .detect_change(&state(TransportationMode::Walking, 600), None)
            .is_some());
        assert!(recorder
            .detect_change(&state(TransportationMode::Stationary, 100), None)
            .is_none());

        let stopped = recorder
            .detect_change(&state(TransportationMode::Stationary, 620), None)
            .unwrap();
        assert_eq!(stopped.previous_mode, TransportationMode::Walking);
        assert_eq!(stopped.detection_latency_ms, 20_000);

        recorder.observe_location(&LocationSample::new(52.0, 13.0, 5.0, t(700)));
        recorder.observe_location(&LocationSample::new(52.1, 13.0, 5.0, t(690)));
        assert!(recorder
            .detect_change(&state(TransportationMode::InVehicle, 650), None)
            .is_none());

        let driving = recorder
            .detect_change(&state(TransportationMode::InVehicle, 710), None)
            .unwrap();
        assert_eq!(driving.location.unwrap().latitude, 52.0);
    }

    #[tokio::test]
    async fn failed_telemetry_still_yields_an_event() {
        let mut recorder = MovementEventRecorder::new(Arc::new(Failing), Duration::from_secs(2));
        let event = recorder
            .record(&state(TransportationMode::Cycling, 0), None)
            .await
            .unwrap();
        assert!(event.sensor_telemetry.is_none());
        assert!(event.device_state.is_none());
    }

    #[tokio::test]
    async fn recorder_task_persists_events_tagged_with_the_open_trip() {
        let db = Database::in_memory().unwrap();
        let (trip_tx, trip_rx) = watch::channel(Some("trip-9".to_string()));
        let cancel = CancellationToken::new();
        let recorder =
            MovementEventRecorder::new(Arc::new(Accelerometer), Duration::from_secs(2));
        let (handle, task) = spawn_recorder(recorder, db.clone(), trip_rx, cancel.clone());

        handle
            .send(RecorderCommand::Mode(state(TransportationMode::Walking, 0)))
            .unwrap();
        handle
            .send(RecorderCommand::Mode(state(TransportationMode::Walking, 10)))
            .unwrap();
        handle.flush().await.unwrap();
        trip_tx.send(None).unwrap();
        handle
            .send(RecorderCommand::Mode(state(TransportationMode::Stationary, 20)))
            .unwrap();
        handle.flush().await.unwrap();

        let events = db.get_movement_events_in_range(t(0), t(60)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].trip_id.as_deref(), Some("trip-9"));
        assert_eq!(
            events[0].sensor_telemetry.as_ref().unwrap().accelerometer_variance,
            Some(0.4)
        );
        assert_eq!(events[1].trip_id, None);
        assert_eq!(events[1].detection_latency_ms, 10_000);

        cancel.cancel();
        task.await.unwrap();
    }
}
