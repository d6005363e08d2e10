pub mod segment_tracker;

pub use segment_tracker::{apply_summary, summarize, ModeSegmentTracker, ModeSummary};
