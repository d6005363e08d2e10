mod checkpoints;
mod locations;
mod matched_points;
mod movement_events;
mod trips;
