//! Cancellable deadline timers for the open trip.
//!
//! Each armed timer carries a generation number handed out by the state machine. The
//! timer task and `cancel` race on a single atomic status word, so the expiry callback
//! runs at most once and a cancellation that arrives after the callback started is a
//! no-op reported as [`EngineError::TimerRaceLost`].

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::models::TransportationMode;
use crate::settings::TripSettings;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerPurpose {
    /// A STATIONARY candidate has to hold for the debounce window before the trip enters
    /// PENDING_END.
    ConfirmStationary,
    /// Grace period after which a PENDING_END trip is completed.
    GraceExpiry,
}

/// Deadline entry owned by the state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingTimer {
    pub generation: u64,
    pub purpose: TimerPurpose,
    pub deadline: DateTime<Utc>,
}

/// Grace period before finalizing a trip whose last moving mode was `mode`.
pub fn grace_period_for(mode: TransportationMode, settings: &TripSettings) -> Duration {
    match mode {
        TransportationMode::InVehicle => Duration::seconds(settings.vehicle_grace_seconds as i64),
        _ => Duration::seconds(settings.walking_grace_seconds as i64),
    }
}

/// Handle to an armed timer.
#[derive(Debug, Clone)]
pub struct GraceHandle {
    pub timer: PendingTimer,
    status: Arc<AtomicU8>,
}

impl GraceHandle {
    pub fn has_fired(&self) -> bool {
        self.status.load(Ordering::Acquire) == FIRED
    }
}

struct ArmedTimer {
    handle: GraceHandle,
    task: JoinHandle<()>,
}

/// Runs at most one deadline task at a time.
#[derive(Default)]
pub struct GracePeriodManager {
    armed: Option<ArmedTimer>,
}

impl GracePeriodManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self) -> Option<&GraceHandle> {
        self.armed.as_ref().map(|armed| &armed.handle)
    }

    /// Schedule `on_expire` at `timer.deadline`, cancelling whatever was armed before.
    ///
    /// Must be called from within a tokio runtime. A deadline in the past fires on the next
    /// scheduler turn.
    pub fn arm<F>(&mut self, timer: PendingTimer, on_expire: F) -> GraceHandle
    where
        F: FnOnce(PendingTimer) + Send + 'static,
    {
        if let Some(previous) = self.armed.as_ref().map(|armed| armed.handle.clone()) {
            let _ = self.cancel(&previous);
        }

        let status = Arc::new(AtomicU8::new(ARMED));
        let handle = GraceHandle {
            timer,
            status: status.clone(),
        };

        let delay = (timer.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if status
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                on_expire(timer);
            }
        });

        self.armed = Some(ArmedTimer {
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Cancel `handle` if it is still pending.
    ///
    /// Cancelling a timer that is no longer the armed one is a no-op.
    pub fn cancel(&mut self, handle: &GraceHandle) -> Result<(), EngineError> {
        let is_current = self
            .armed
            .as_ref()
            .map(|armed| armed.handle.timer.generation == handle.timer.generation)
            .unwrap_or(false);
        if is_current {
            if let Some(armed) = self.armed.take() {
                armed.task.abort();
            }
        }

        match handle
            .status
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(FIRED) => {
                debug!(
                    "timer {} already fired before cancellation",
                    handle.timer.generation
                );
                Err(EngineError::TimerRaceLost {
                    generation: handle.timer.generation,
                })
            }
            Err(_) => Ok(()),
        }
    }

    /// Cancel by generation; unknown generations are ignored.
    pub fn cancel_generation(&mut self, generation: u64) -> Result<(), EngineError> {
        match self.armed.as_ref().map(|armed| armed.handle.clone()) {
            Some(handle) if handle.timer.generation == generation => self.cancel(&handle),
            _ => Ok(()),
        }
    }

    pub fn cancel_all(&mut self) {
        if let Some(handle) = self.armed.as_ref().map(|armed| armed.handle.clone()) {
            let _ = self.cancel(&handle);
        }
    }
}

impl Drop for GracePeriodManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
