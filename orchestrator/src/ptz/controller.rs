use camwatch_common::{Event, EventType};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{IntentKind, MovementIntent};
use crate::camera::PtzDevice;
use crate::error::{OrchestratorError, Result};
use crate::messaging::EventHub;
use crate::metrics::Metrics;

struct CameraChannel {
    intents: watch::Sender<Option<MovementIntent>>,
    issued: AtomicU64,
    applied: Arc<AtomicU64>,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Streams currently attached to this camera.
    holders: DashSet<String>,
}

/// Single writer per camera.
///
/// Each camera holds exactly one pending intent slot. A newer intent replaces
/// whatever the writer has not picked up yet, and the writer never applies a
/// sequence at or below the last one it sent.
pub struct PtzController {
    cameras: DashMap<String, Arc<CameraChannel>>,
    hub: EventHub,
    metrics: Arc<Metrics>,
}

impl PtzController {
    pub fn new(hub: EventHub, metrics: Arc<Metrics>) -> Self {
        Self {
            cameras: DashMap::new(),
            hub,
            metrics,
        }
    }

    /// Attaches `stream_id` to the writer for `camera_id`, starting the writer
    /// on first use. Streams sharing a camera share its writer; their own
    /// `device` handle is dropped.
    pub fn register(&self, camera_id: &str, stream_id: &str, device: Arc<dyn PtzDevice>) {
        match self.cameras.entry(camera_id.to_string()) {
            Entry::Occupied(existing) => {
                existing.get().holders.insert(stream_id.to_string());
                info!(camera_id, stream_id, holders = existing.get().holders.len(), "PTZ writer shared");
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                let cancel = CancellationToken::new();
                let applied = Arc::new(AtomicU64::new(0));

                let writer = tokio::spawn(writer_loop(
                    camera_id.to_string(),
                    stream_id.to_string(),
                    device,
                    rx,
                    applied.clone(),
                    self.hub.clone(),
                    self.metrics.clone(),
                    cancel.clone(),
                ));

                let holders = DashSet::new();
                holders.insert(stream_id.to_string());
                slot.insert(Arc::new(CameraChannel {
                    intents: tx,
                    issued: AtomicU64::new(0),
                    applied,
                    cancel,
                    writer: Mutex::new(Some(writer)),
                    holders,
                }));
                info!(camera_id, stream_id, "PTZ writer registered");
            }
        }
    }

    /// Detaches `stream_id`. The writer is stopped, abandoning any pending
    /// intent, once no stream holds the camera any more.
    pub async fn unregister(&self, camera_id: &str, stream_id: &str) {
        let removed = self.cameras.remove_if(camera_id, |_, channel| {
            channel.holders.remove(stream_id);
            channel.holders.is_empty()
        });
        let Some((_, channel)) = removed else {
            debug!(camera_id, stream_id, "PTZ writer kept for remaining streams");
            return;
        };
        channel.cancel.cancel();
        if let Some(writer) = channel.writer.lock().await.take() {
            if let Err(e) = writer.await {
                warn!(camera_id, error = %e, "PTZ writer ended abnormally");
            }
        }
        debug!(camera_id, "PTZ writer unregistered");
    }

    pub fn is_registered(&self, camera_id: &str) -> bool {
        self.cameras.contains_key(camera_id)
    }

    /// Queues `kind` for `camera_id`, superseding any intent not yet applied.
    /// Returns the sequence stamped on the intent.
    pub fn move_camera(&self, camera_id: &str, kind: IntentKind) -> Result<u64> {
        let channel = self
            .cameras
            .get(camera_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| OrchestratorError::NotFoundError(format!("no PTZ device for camera {}", camera_id)))?;

        let sequence = channel.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let intent = MovementIntent {
            camera_id: camera_id.to_string(),
            kind,
            sequence,
        };
        channel.intents.send_replace(Some(intent));
        Ok(sequence)
    }

    /// Sequence of the last intent accepted by `move_camera` (0 if none).
    pub fn last_issued(&self, camera_id: &str) -> Option<u64> {
        self.cameras
            .get(camera_id)
            .map(|c| c.issued.load(Ordering::SeqCst))
    }

    /// Sequence of the last intent handed to the device (0 if none).
    pub fn last_applied(&self, camera_id: &str) -> Option<u64> {
        self.cameras
            .get(camera_id)
            .map(|c| c.applied.load(Ordering::SeqCst))
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_loop(
    camera_id: String,
    stream_id: String,
    device: Arc<dyn PtzDevice>,
    mut intents: watch::Receiver<Option<MovementIntent>>,
    applied: Arc<AtomicU64>,
    hub: EventHub,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = intents.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(intent) = intents.borrow_and_update().clone() else {
            continue;
        };
        if intent.sequence <= applied.load(Ordering::SeqCst) {
            continue;
        }
        applied.store(intent.sequence, Ordering::SeqCst);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = device.send_command(&intent) => result,
        };

        match result {
            Ok(()) => {
                metrics.record_ptz_command(&camera_id, true);
                debug!(camera_id = %camera_id, sequence = intent.sequence, kind = ?intent.kind, "PTZ command applied");
            }
            Err(e) => {
                metrics.record_ptz_command(&camera_id, false);
                warn!(camera_id = %camera_id, sequence = intent.sequence, error = %e, "PTZ command failed");
                hub.emit(Event::new(
                    EventType::PtzCommandFailed,
                    stream_id.as_str(),
                    camera_id.as_str(),
                    json!({
                        "sequence": intent.sequence,
                        "intent": intent.kind,
                        "error": e.to_string(),
                    }),
                ));
            }
        }
    }

    debug!(camera_id = %camera_id, "PTZ writer stopped");
}
