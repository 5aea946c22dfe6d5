use async_trait::async_trait;
use camwatch_common::Event;
use tracing::{info, warn};

use super::{EventSink, Notifier};
use crate::error::{OrchestratorError, Result};

/// Writes every event as one JSON line on the `camwatch::events` target.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(line) => info!(target: "camwatch::events", "{}", line),
            Err(e) => warn!(
                target: "camwatch::events",
                event_type = %event.event_type,
                error = %e,
                "Event serialization failed"
            ),
        }
    }
}

/// Notifier that only logs. Stands in where no delivery channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| OrchestratorError::CommandError(e.to_string()))?;
        warn!(
            target: "camwatch::notify",
            event_type = %event.event_type,
            stream_id = %event.stream_id,
            camera_id = %event.camera_id,
            %payload,
            "Notification"
        );
        Ok(())
    }
}
