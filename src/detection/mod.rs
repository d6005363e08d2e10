pub mod algorithm;
pub mod config;
pub mod debounce;

pub use algorithm::{StartDecision, TripDetector};
pub use config::DetectionConfig;
pub use debounce::{Candidate, ModeDebouncer, Observation};
