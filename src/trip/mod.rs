pub mod backfill;
pub mod controller;
pub mod finalizer;
pub mod grace;
pub mod state;
pub mod writes;

pub use backfill::{backfill_trips, reconstruct_trips};
pub use controller::{ClockSource, EngineOptions, TripEngine};
pub use finalizer::{DiscardReason, FinalizeOutcome, TripFinalizer};
pub use grace::{grace_period_for, GraceHandle, GracePeriodManager, PendingTimer, TimerPurpose};
pub use state::{Effect, EngineInput, OpenTrip, TripCheckpoint, TripStateMachine};
