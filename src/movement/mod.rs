pub mod recorder;
pub mod telemetry;

pub use recorder::{spawn_recorder, MovementEventRecorder, RecorderCommand, RecorderHandle};
pub use telemetry::{collect_with_timeout, NoTelemetry, TelemetryProvider};
