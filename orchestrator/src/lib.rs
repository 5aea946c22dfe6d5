//! Stream orchestration and camera control for a multi-camera surveillance
//! node: per-camera workers with reconnect and staleness supervision, bounded
//! detection pipelines, event fan-out, and autotracking PTZ control.

pub mod camera;
pub mod config;
pub mod error;
pub mod health;
pub mod inference;
pub mod messaging;
pub mod metrics;
pub mod pipeline;
pub mod processing;
pub mod ptz;
pub mod stream;

#[cfg(test)]
mod testing;

pub use camera::{CameraConnector, CameraLink, PtzDevice, RawFrame};
pub use config::{NodeConfig, StreamConfig};
pub use error::{OrchestratorError, Result};
pub use inference::Detector;
pub use messaging::{EventHub, EventSink, LogNotifier, Notifier, TracingSink};
pub use metrics::Metrics;
pub use ptz::{IntentKind, MovementIntent, PtzPosition};
pub use stream::StreamManager;
