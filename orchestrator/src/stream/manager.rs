use camwatch_common::utils::generate_unique_id;
use camwatch_common::{EventType, StreamState, StreamStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{publish_transition, transition, Collaborators, StreamWorker, WorkerEvent};
use super::StreamContext;
use crate::camera::CameraConnector;
use crate::config::{NodeConfig, StreamConfig};
use crate::error::{OrchestratorError, Result};
use crate::inference::Detector;
use crate::messaging::EventHub;
use crate::metrics::Metrics;
use crate::ptz::{AutotrackCoordinator, IntentKind, Patrol, PtzController};

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct StreamEntry {
    config: StreamConfig,
    ctx: StreamContext,
    autotrack: Arc<Mutex<AutotrackCoordinator>>,
    /// Serializes start/stop/restart for this stream and holds its worker.
    lifecycle: Mutex<Option<WorkerHandle>>,
    /// Patrol sweep task. Taken after `lifecycle` when both are needed.
    patrol: Mutex<Option<WorkerHandle>>,
    removed: AtomicBool,
}

/// Registry and lifecycle supervisor for every stream on the node.
///
/// The registry map is only touched for lookups and (un)registration. All
/// lifecycle changes go through the per-stream `lifecycle` lock, so there is
/// never more than one worker per stream and one stream never waits on
/// another.
pub struct StreamManager {
    streams: DashMap<String, Arc<StreamEntry>>,
    deps: Collaborators,
    hub: EventHub,
    metrics: Arc<Metrics>,
}

impl StreamManager {
    pub fn new(
        node: &NodeConfig,
        connector: Arc<dyn CameraConnector>,
        detector: Arc<dyn Detector>,
        hub: EventHub,
        metrics: Arc<Metrics>,
    ) -> Self {
        let ptz = Arc::new(PtzController::new(hub.clone(), metrics.clone()));
        Self {
            streams: DashMap::new(),
            deps: Collaborators {
                connector,
                detector,
                ptz,
                pipeline: node.pipeline.clone(),
                health_check_interval: node.health_check_interval(),
            },
            hub,
            metrics,
        }
    }

    /// Validates `config` and adds the stream in `Idle`. Returns its id,
    /// generated when the config carries none.
    pub fn register(&self, mut config: StreamConfig) -> Result<String> {
        config.check()?;
        let stream_id = config.stream_id.clone().unwrap_or_else(generate_unique_id);
        config.stream_id = Some(stream_id.clone());

        match self.streams.entry(stream_id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::ConfigError(format!(
                "stream {} is already registered",
                stream_id
            ))),
            Entry::Vacant(slot) => {
                let (status, _) = watch::channel(StreamStatus::new(
                    stream_id.as_str(),
                    config.camera_id.as_str(),
                    config.autotrack_enabled,
                ));
                let ctx = StreamContext {
                    stream_id: stream_id.clone(),
                    camera_id: config.camera_id.clone(),
                    hub: self.hub.clone(),
                    metrics: self.metrics.clone(),
                    status: Arc::new(status),
                };
                let autotrack = AutotrackCoordinator::new(ctx.clone(), &config, self.deps.ptz.clone());

                info!(
                    stream_id = %stream_id,
                    camera_id = %config.camera_id,
                    source = %config.source_uri,
                    detection = config.detection_enabled,
                    autotrack = config.autotrack_enabled,
                    "Stream registered"
                );
                slot.insert(Arc::new(StreamEntry {
                    config,
                    ctx,
                    autotrack: Arc::new(Mutex::new(autotrack)),
                    lifecycle: Mutex::new(None),
                    patrol: Mutex::new(None),
                    removed: AtomicBool::new(false),
                }));
                Ok(stream_id)
            }
        }
    }

    /// Spawns the stream's worker. A no-op while a worker is alive; a stream
    /// parked in `Error` is started afresh.
    pub async fn start(&self, stream_id: &str) -> Result<()> {
        let entry = self.entry(stream_id)?;
        let mut lifecycle = entry.lifecycle.lock().await;
        self.start_locked(&entry, &mut lifecycle).await
    }

    /// Ends any patrol, cancels the worker and waits until it has released
    /// the camera. A stream parked in `Error` moves to `Stopped`; otherwise a
    /// no-op for a stream that is not running.
    pub async fn stop(&self, stream_id: &str) -> Result<()> {
        let entry = self.entry(stream_id)?;
        let mut lifecycle = entry.lifecycle.lock().await;
        halt_patrol(&entry, &mut *entry.patrol.lock().await, &self.deps.ptz).await;
        stop_locked(&entry, &mut lifecycle).await;
        Ok(())
    }

    pub async fn restart(&self, stream_id: &str) -> Result<()> {
        let entry = self.entry(stream_id)?;
        let mut lifecycle = entry.lifecycle.lock().await;
        stop_locked(&entry, &mut lifecycle).await;
        self.start_locked(&entry, &mut lifecycle).await
    }

    pub async fn unregister(&self, stream_id: &str) -> Result<()> {
        let entry = self.entry(stream_id)?;
        let mut lifecycle = entry.lifecycle.lock().await;
        halt_patrol(&entry, &mut *entry.patrol.lock().await, &self.deps.ptz).await;
        stop_locked(&entry, &mut lifecycle).await;
        entry.removed.store(true, Ordering::SeqCst);
        self.streams.remove(stream_id);
        info!(stream_id, "Stream unregistered");
        Ok(())
    }

    pub fn status(&self, stream_id: &str) -> Result<StreamStatus> {
        let entry = self.entry(stream_id)?;
        let status = entry.ctx.status.borrow().clone();
        Ok(status)
    }

    /// Change feed of one stream's status.
    pub fn subscribe(&self, stream_id: &str) -> Result<watch::Receiver<StreamStatus>> {
        Ok(self.entry(stream_id)?.ctx.status.subscribe())
    }

    /// Status of every registered stream, ordered by stream id.
    pub fn list(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<StreamStatus> = self
            .streams
            .iter()
            .map(|entry| entry.value().ctx.status.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        statuses
    }

    /// Runtime autotrack switch. Returns whether the setting changed.
    pub async fn set_autotrack(&self, stream_id: &str, enabled: bool) -> Result<bool> {
        let entry = self.entry(stream_id)?;
        if enabled {
            entry.config.check_autotrack_capable()?;
        }
        let changed = entry.autotrack.lock().await.set_enabled(enabled);
        Ok(changed)
    }

    /// Manual PTZ command through the camera's single writer. Fails with
    /// `NotFoundError` while the stream has no attached PTZ device.
    pub fn ptz_command(&self, stream_id: &str, kind: IntentKind) -> Result<u64> {
        let entry = self.entry(stream_id)?;
        self.deps.ptz.move_camera(&entry.ctx.camera_id, kind)
    }

    /// Sweeps the stream's camera over its patrol grid until `stop_patrol`
    /// or `stop`. Returns false when a patrol is already running.
    pub async fn start_patrol(&self, stream_id: &str) -> Result<bool> {
        let entry = self.entry(stream_id)?;
        entry.config.check_patrol_capable()?;

        let mut patrol = entry.patrol.lock().await;
        if entry.removed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NotFoundError(format!("stream {}", stream_id)));
        }
        if patrol.as_ref().is_some_and(|handle| !handle.join.is_finished()) {
            debug!(stream_id, "Patrol already running");
            return Ok(false);
        }

        let engaged = entry.autotrack.lock().await.engaged();
        let task = Patrol::new(entry.ctx.clone(), &entry.config, self.deps.ptz.clone(), engaged);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(task.run(cancel.clone()));
        *patrol = Some(WorkerHandle { cancel, join });

        announce_patrol(&entry.ctx, true);
        Ok(true)
    }

    /// Ends the patrol and halts the camera. Returns false when none was running.
    pub async fn stop_patrol(&self, stream_id: &str) -> Result<bool> {
        let entry = self.entry(stream_id)?;
        let mut patrol = entry.patrol.lock().await;
        Ok(halt_patrol(&entry, &mut patrol, &self.deps.ptz).await)
    }

    /// Stops every stream, in parallel.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<StreamEntry>> = self.streams.iter().map(|e| e.value().clone()).collect();
        info!(streams = entries.len(), "Stopping all streams");

        let ptz = &self.deps.ptz;
        join_all(entries.iter().map(|entry| async move {
            let mut lifecycle = entry.lifecycle.lock().await;
            halt_patrol(entry, &mut *entry.patrol.lock().await, ptz).await;
            stop_locked(entry, &mut lifecycle).await;
        }))
        .await;
    }

    pub fn ptz(&self) -> &Arc<PtzController> {
        &self.deps.ptz
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn entry(&self, stream_id: &str) -> Result<Arc<StreamEntry>> {
        self.streams
            .get(stream_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::NotFoundError(format!("stream {}", stream_id)))
    }

    async fn start_locked(&self, entry: &Arc<StreamEntry>, lifecycle: &mut Option<WorkerHandle>) -> Result<()> {
        if entry.removed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NotFoundError(format!("stream {}", entry.ctx.stream_id)));
        }

        if let Some(handle) = lifecycle.as_ref() {
            let parked = entry.ctx.status.borrow().state == StreamState::Error;
            if !handle.join.is_finished() && !parked {
                debug!(stream_id = %entry.ctx.stream_id, "Start ignored, worker already running");
                return Ok(());
            }
        }
        if let Some(previous) = lifecycle.take() {
            reap(&entry.ctx.stream_id, previous.join).await;
        }

        let cancel = CancellationToken::new();
        let worker = StreamWorker::new(
            entry.ctx.clone(),
            entry.config.clone(),
            entry.autotrack.clone(),
            self.deps.clone(),
        );
        let join = tokio::spawn(worker.run(cancel.clone()));
        *lifecycle = Some(WorkerHandle { cancel, join });

        info!(stream_id = %entry.ctx.stream_id, "Stream worker spawned");
        Ok(())
    }
}

async fn stop_locked(entry: &StreamEntry, lifecycle: &mut Option<WorkerHandle>) {
    match lifecycle.take() {
        Some(handle) => {
            handle.cancel.cancel();
            reap(&entry.ctx.stream_id, handle.join).await;
            info!(stream_id = %entry.ctx.stream_id, "Stream stopped");
        }
        None => debug!(stream_id = %entry.ctx.stream_id, "Stop ignored, stream not running"),
    }

    // a worker that gave up at the failure ceiling exits without applying the stop
    let state = entry.ctx.status.borrow().state;
    if state == StreamState::Error {
        if let Some(next) = transition(state, WorkerEvent::StopRequested) {
            publish_transition(&entry.ctx, state, next, WorkerEvent::StopRequested, None);
        }
    }
}

async fn halt_patrol(entry: &StreamEntry, patrol: &mut Option<WorkerHandle>, ptz: &PtzController) -> bool {
    let Some(handle) = patrol.take() else {
        return false;
    };
    handle.cancel.cancel();
    reap(&entry.ctx.stream_id, handle.join).await;
    if let Err(e) = ptz.move_camera(&entry.ctx.camera_id, IntentKind::Stop) {
        debug!(stream_id = %entry.ctx.stream_id, error = %e, "Patrol ended without a PTZ writer");
    }
    announce_patrol(&entry.ctx, false);
    true
}

fn announce_patrol(ctx: &StreamContext, active: bool) {
    ctx.status.send_modify(|s| s.patrol_active = active);
    ctx.emit(EventType::PatrolToggled, json!({ "active": active }));
    info!(stream_id = %ctx.stream_id, active, "Patrol toggled");
}

async fn reap(stream_id: &str, join: JoinHandle<()>) {
    if let Err(e) = join.await {
        warn!(stream_id, error = %e, "Stream worker ended abnormally");
    }
}
