use camwatch_common::{Event, EventType, StreamStatus};
use std::sync::Arc;
use tokio::sync::watch;

use crate::messaging::EventHub;
use crate::metrics::Metrics;

mod manager;
mod worker;

pub use manager::StreamManager;
pub use worker::{transition, Collaborators, StreamWorker, WorkerEvent};

/// Identity and injected handles shared by every component of one stream.
/// Lives as long as the stream's registration, across worker restarts.
#[derive(Clone)]
pub struct StreamContext {
    pub stream_id: String,
    pub camera_id: String,
    pub hub: EventHub,
    pub metrics: Arc<Metrics>,
    pub status: Arc<watch::Sender<StreamStatus>>,
}

impl StreamContext {
    pub fn event(&self, event_type: EventType, payload: serde_json::Value) -> Event {
        Event::new(event_type, self.stream_id.as_str(), self.camera_id.as_str(), payload)
    }

    pub fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        self.hub.emit(self.event(event_type, payload));
    }
}
