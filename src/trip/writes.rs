//! Writes waiting for the database.
//!
//! Location samples are bounded and never hold up the trip lifecycle writes queued behind
//! them: a sample the database keeps rejecting stays queued while trips, checkpoints and
//! reference updates go through.

use std::collections::VecDeque;

use crate::models::{LocationSample, Trip};

use super::state::TripCheckpoint;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

pub const MAX_PENDING_LOCATIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub enum PendingWrite {
    Location {
        sample: LocationSample,
        trip_id: Option<String>,
    },
    Checkpoint(TripCheckpoint),
    ClearCheckpoint,
    Trip(Trip),
    Reassign {
        from: String,
        to: Option<String>,
    },
}

impl PendingWrite {
    pub fn describe(&self) -> String {
        match self {
            PendingWrite::Location { .. } => "location sample".to_string(),
            PendingWrite::Checkpoint(checkpoint) => {
                format!("checkpoint of trip {}", checkpoint.open.trip.id)
            }
            PendingWrite::ClearCheckpoint => "checkpoint removal".to_string(),
            PendingWrite::Trip(trip) => format!("trip {}", trip.id),
            PendingWrite::Reassign { from, .. } => format!("references of trip {from}"),
        }
    }

    pub fn is_location(&self) -> bool {
        matches!(self, PendingWrite::Location { .. })
    }
}

pub struct WriteQueue {
    writes: VecDeque<PendingWrite>,
    locations: usize,
    location_limit: usize,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::with_location_limit(MAX_PENDING_LOCATIONS)
    }
}

impl WriteQueue {
    pub fn with_location_limit(location_limit: usize) -> Self {
        Self {
            writes: VecDeque::new(),
            locations: 0,
            location_limit: location_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PendingWrite> {
        self.writes.get(index)
    }

    /// Queue a write. A checkpoint replaces any older one still queued; past the limit the
    /// oldest location sample is dropped.
    pub fn push(&mut self, write: PendingWrite) {
        match &write {
            PendingWrite::Checkpoint(_) => {
                self.writes
                    .retain(|queued| !matches!(queued, PendingWrite::Checkpoint(_)));
            }
            PendingWrite::Location { .. } => {
                if self.locations >= self.location_limit {
                    if let Some(index) = self.writes.iter().position(PendingWrite::is_location) {
                        if let Some(PendingWrite::Location { sample, .. }) =
                            self.writes.remove(index)
                        {
                            log_warn!(
                                "dropping unpersisted location sample from {}",
                                sample.timestamp
                            );
                        }
                        self.locations -= 1;
                    }
                }
                self.locations += 1;
            }
            _ => {}
        }
        self.writes.push_back(write);
    }

    pub fn remove(&mut self, index: usize) -> Option<PendingWrite> {
        let write = self.writes.remove(index)?;
        if write.is_location() {
            self.locations -= 1;
        }
        Some(write)
    }

    /// Point queued samples of trip `from` at `to`, after the stored ones were moved.
    pub fn retag_locations(&mut self, from: &str, to: Option<&str>) {
        for write in self.writes.iter_mut() {
            if let PendingWrite::Location { trip_id, .. } = write {
                if trip_id.as_deref() == Some(from) {
                    *trip_id = to.map(str::to_string);
                }
            }
        }
    }
}
