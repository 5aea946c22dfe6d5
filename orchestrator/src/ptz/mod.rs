mod autotrack;
mod controller;
mod patrol;
mod tracker;
mod types;

pub use autotrack::AutotrackCoordinator;
pub use controller::PtzController;
pub use patrol::{grid_waypoints, Patrol};
pub use tracker::{select_target, TrackEvent, TrackState, TrackedTarget, Tracker, TrackerOutput};
pub use types::{IntentKind, MovementIntent, PtzPosition};
