pub mod location;
pub mod mode;
pub mod movement_event;
pub mod trip;

pub use location::{haversine_meters, LocationSample};
pub use mode::{DetectionSource, TransportationMode, TransportationState};
pub use movement_event::{DeviceState, MovementEvent, SensorTelemetry, TelemetrySnapshot};
pub use trip::{ModeSegment, Trip, TripState, TripTrigger, TripWithLocations};
