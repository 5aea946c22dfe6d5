use camwatch_common::{Detection, EventType};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StreamConfig;
use crate::pipeline::DetectionBatch;
use crate::ptz::AutotrackCoordinator;
use crate::stream::StreamContext;

/// Last stage of a stream's pipeline: turns detection batches into events,
/// notifications and tracker input.
pub struct EventProcessor {
    ctx: StreamContext,
    confidence_threshold: f32,
    allowed_classes: HashSet<String>,
    cooldown: Duration,
    last_notified: Option<Instant>,
    autotrack: Option<Arc<Mutex<AutotrackCoordinator>>>,
}

impl EventProcessor {
    pub fn new(
        ctx: StreamContext,
        config: &StreamConfig,
        autotrack: Option<Arc<Mutex<AutotrackCoordinator>>>,
    ) -> Self {
        Self {
            ctx,
            confidence_threshold: config.confidence_threshold,
            allowed_classes: config.allowed_classes.iter().cloned().collect(),
            cooldown: config.notification_cooldown(),
            last_notified: None,
            autotrack,
        }
    }

    pub async fn run(mut self, mut batches: mpsc::Receiver<DetectionBatch>, cancel: CancellationToken) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.handle(batch).await;
        }
        debug!(stream_id = %self.ctx.stream_id, "Event processor stopped");
    }

    pub async fn handle(&mut self, batch: DetectionBatch) {
        let confident: Vec<Detection> = batch
            .detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .collect();

        let reportable: Vec<&Detection> = confident
            .iter()
            .filter(|d| self.is_allowed(&d.class_label))
            .collect();

        if !reportable.is_empty() {
            let event = self.ctx.event(
                EventType::Detection,
                json!({
                    "frame_seq": batch.frame_seq,
                    "captured_at": batch.captured_at,
                    "detections": reportable,
                }),
            );

            if self.cooldown_elapsed() {
                self.last_notified = Some(Instant::now());
                self.ctx.hub.emit_and_notify(event);
            } else {
                self.ctx.hub.emit(event);
            }
        }

        // Empty batches still count: the tracker ages its target on them.
        if let Some(autotrack) = &self.autotrack {
            autotrack.lock().await.on_detections(batch.frame_seq, &confident);
        }
    }

    fn is_allowed(&self, label: &str) -> bool {
        self.allowed_classes.is_empty() || self.allowed_classes.contains(label)
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_notified
            .map_or(true, |last| last.elapsed() >= self.cooldown)
    }
}
