use camwatch_common::{EventType, Frame, StreamState};
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamContext;
use crate::camera::{CameraConnector, CameraLink, RawFrame};
use crate::config::{PipelineConfig, StreamConfig};
use crate::error::{OrchestratorError, Result};
use crate::health::{BackoffPolicy, HealthMonitor, Heartbeat};
use crate::inference::Detector;
use crate::pipeline::DetectionPipeline;
use crate::processing::EventProcessor;
use crate::ptz::{AutotrackCoordinator, PtzController};

/// Inputs to the stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    StartRequested,
    FirstFrame,
    LinkFailed,
    StaleDetected,
    CeilingReached,
    StopRequested,
}

impl WorkerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartRequested => "start_requested",
            Self::FirstFrame => "first_frame",
            Self::LinkFailed => "link_failed",
            Self::StaleDetected => "stale_detected",
            Self::CeilingReached => "ceiling_reached",
            Self::StopRequested => "stop_requested",
        }
    }
}

/// Stream lifecycle transition table. `None` means the event does not apply
/// in `state`.
pub fn transition(state: StreamState, event: WorkerEvent) -> Option<StreamState> {
    use StreamState as S;
    use WorkerEvent as E;

    match (state, event) {
        (S::Idle | S::Stopped | S::Error, E::StartRequested) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, E::FirstFrame) => Some(S::Active),
        (S::Connecting | S::Reconnecting, E::LinkFailed) => Some(S::Reconnecting),
        (S::Active, E::LinkFailed | E::StaleDetected) => Some(S::Reconnecting),
        (S::Connecting | S::Reconnecting, E::CeilingReached) => Some(S::Error),
        (S::Stopped, E::StopRequested) => None,
        (_, E::StopRequested) => Some(S::Stopped),
        _ => None,
    }
}

/// Node-wide services every worker is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn CameraConnector>,
    pub detector: Arc<dyn Detector>,
    pub ptz: Arc<PtzController>,
    pub pipeline: PipelineConfig,
    pub health_check_interval: Duration,
}

enum LinkEnd {
    Cancelled,
    Stale,
    Failed(OrchestratorError),
}

enum Exit {
    Stopped,
    Failed,
}

/// Owns one camera for the lifetime of a start/stop cycle: connection,
/// ingestion, reconnects, the detection pipeline, the health monitor and the
/// PTZ writer registration.
pub struct StreamWorker {
    ctx: StreamContext,
    config: StreamConfig,
    autotrack: Arc<Mutex<AutotrackCoordinator>>,
    deps: Collaborators,
    policy: BackoffPolicy,
    state: StreamState,
    sequence: u64,
    last_frame_at: Option<Instant>,
}

impl StreamWorker {
    pub fn new(
        ctx: StreamContext,
        config: StreamConfig,
        autotrack: Arc<Mutex<AutotrackCoordinator>>,
        deps: Collaborators,
    ) -> Self {
        let state = ctx.status.borrow().state;
        Self {
            policy: BackoffPolicy::from_config(&config.backoff),
            ctx,
            config,
            autotrack,
            deps,
            state,
            sequence: 0,
            last_frame_at: None,
        }
    }

    /// Runs until `cancel` fires or the failure ceiling parks the stream in
    /// `Error`. Everything the worker started is torn down before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let ctx = self.ctx.clone();
        ctx.metrics.worker_started();
        ctx.status.send_modify(|s| {
            s.reconnect_attempt = 0;
            s.backoff_ms = None;
            s.last_error = None;
            s.fps = 0.0;
        });
        self.apply(WorkerEvent::StartRequested, None);

        let ptz_attached = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            attached = self.attach_ptz() => attached,
        };

        let heartbeat = Heartbeat::new();
        let stale = Arc::new(Notify::new());
        let monitor_cancel = cancel.child_token();
        let monitor = HealthMonitor::new(
            ctx.clone(),
            heartbeat.clone(),
            stale.clone(),
            self.config.staleness_window(),
            self.deps.health_check_interval,
        )
        .spawn(monitor_cancel.clone());

        let pipeline = self.config.detection_enabled.then(|| {
            let processor = EventProcessor::new(ctx.clone(), &self.config, Some(self.autotrack.clone()));
            DetectionPipeline::start(
                ctx.clone(),
                self.deps.detector.clone(),
                processor,
                &self.deps.pipeline,
                self.config.detection_interval(),
                &cancel,
            )
        });

        let exit = self
            .supervise(&cancel, pipeline.as_ref(), &heartbeat, &stale)
            .await;

        monitor_cancel.cancel();
        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        if let Err(e) = monitor.await {
            warn!(stream_id = %ctx.stream_id, error = %e, "Health monitor ended abnormally");
        }
        if ptz_attached {
            self.deps.ptz.unregister(&ctx.camera_id, &ctx.stream_id).await;
        }

        if let Exit::Stopped = exit {
            self.apply(WorkerEvent::StopRequested, None);
        }
        ctx.status.send_modify(|s| {
            s.backoff_ms = None;
            s.fps = 0.0;
        });
        ctx.metrics.worker_stopped();
        info!(stream_id = %ctx.stream_id, state = %self.state, "Stream worker finished");
    }

    async fn supervise(
        &mut self,
        cancel: &CancellationToken,
        pipeline: Option<&DetectionPipeline>,
        heartbeat: &Heartbeat,
        stale: &Notify,
    ) -> Exit {
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Exit::Stopped,
                connected = self.connect() => connected,
            };

            match connected {
                Ok((link, first)) => {
                    failures = 0;
                    self.ctx.status.send_modify(|s| {
                        s.reconnect_attempt = 0;
                        s.backoff_ms = None;
                    });
                    self.apply(WorkerEvent::FirstFrame, None);

                    // a staleness signal from the previous link must not hit this one
                    let _ = stale.notified().now_or_never();
                    heartbeat.arm();
                    self.accept_frame(first, pipeline, heartbeat);

                    let end = self.ingest(link, cancel, pipeline, heartbeat, stale).await;
                    heartbeat.disarm();
                    self.last_frame_at = None;

                    match end {
                        LinkEnd::Cancelled => return Exit::Stopped,
                        LinkEnd::Stale => self.apply(
                            WorkerEvent::StaleDetected,
                            Some("no frames within staleness window".to_string()),
                        ),
                        LinkEnd::Failed(e) => {
                            let error = e.to_string();
                            warn!(stream_id = %self.ctx.stream_id, error = %error, "Camera link lost");
                            self.ctx.status.send_modify(|s| s.last_error = Some(error.clone()));
                            self.apply(WorkerEvent::LinkFailed, Some(error));
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let error = e.to_string();
                    let wait = if self.policy.is_exhausted(failures) {
                        None
                    } else {
                        Some(self.policy.delay(failures - 1))
                    };
                    let wait_ms = wait.map(|w| w.as_millis() as u64);

                    self.ctx.metrics.record_reconnect_failure(&self.ctx.stream_id);
                    self.ctx.status.send_modify(|s| {
                        s.reconnect_attempt = failures;
                        s.backoff_ms = wait_ms;
                        s.last_error = Some(error.clone());
                    });
                    warn!(
                        stream_id = %self.ctx.stream_id,
                        attempt = failures,
                        wait_ms = ?wait_ms,
                        error = %error,
                        "Connection attempt failed"
                    );
                    self.ctx.emit(
                        EventType::ReconnectionFailed,
                        json!({
                            "attempt": failures,
                            "wait_ms": wait_ms,
                            "error": error,
                        }),
                    );

                    let Some(wait) = wait else {
                        self.apply(
                            WorkerEvent::CeilingReached,
                            Some(format!("giving up after {} consecutive failures", failures)),
                        );
                        return Exit::Failed;
                    };

                    self.apply(WorkerEvent::LinkFailed, Some(error));
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Exit::Stopped,
                        _ = time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Opens the link and waits for its first frame, both under the connect
    /// timeout.
    async fn connect(&self) -> Result<(Box<dyn CameraLink>, RawFrame)> {
        let connector = &self.deps.connector;
        let source_uri = self.config.source_uri.as_str();

        time::timeout(self.config.connect_timeout(), async {
            let mut link = connector.open(source_uri).await?;
            match link.read_frame().await {
                Ok(first) => Ok::<_, OrchestratorError>((link, first)),
                Err(e) => {
                    link.close().await;
                    Err(e)
                }
            }
        })
        .await?
    }

    async fn ingest(
        &mut self,
        mut link: Box<dyn CameraLink>,
        cancel: &CancellationToken,
        pipeline: Option<&DetectionPipeline>,
        heartbeat: &Heartbeat,
        stale: &Notify,
    ) -> LinkEnd {
        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break LinkEnd::Cancelled,
                _ = stale.notified() => break LinkEnd::Stale,
                read = link.read_frame() => match read {
                    Ok(raw) => self.accept_frame(raw, pipeline, heartbeat),
                    Err(e) => break LinkEnd::Failed(e),
                },
            }
        };

        link.close().await;
        end
    }

    fn accept_frame(&mut self, raw: RawFrame, pipeline: Option<&DetectionPipeline>, heartbeat: &Heartbeat) {
        heartbeat.beat();
        self.sequence += 1;

        let now = Instant::now();
        let fps_sample = self
            .last_frame_at
            .map(|previous| now.duration_since(previous).as_secs_f32())
            .filter(|dt| *dt > 0.0)
            .map(|dt| 1.0 / dt);
        self.last_frame_at = Some(now);

        let captured_at = raw.captured_at;
        self.ctx.metrics.record_frame(&self.ctx.stream_id);
        self.ctx.status.send_modify(|s| {
            s.last_frame_at = Some(captured_at);
            s.frames_received += 1;
            if let Some(sample) = fps_sample {
                s.fps = if s.fps == 0.0 { sample } else { 0.9 * s.fps + 0.1 * sample };
            }
        });

        if let Some(pipeline) = pipeline {
            pipeline.submit(Frame::new(raw.data, raw.width, raw.height, captured_at, self.sequence));
        }
    }

    async fn attach_ptz(&self) -> bool {
        let opened = time::timeout(
            self.config.connect_timeout(),
            self.deps.connector.open_ptz(&self.config),
        )
        .await
        .map_err(OrchestratorError::from)
        .and_then(|result| result);

        match opened {
            Ok(Some(device)) => {
                self.deps
                    .ptz
                    .register(&self.ctx.camera_id, &self.ctx.stream_id, device);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    stream_id = %self.ctx.stream_id,
                    error = %e,
                    "PTZ unavailable, continuing without camera control"
                );
                false
            }
        }
    }

    fn apply(&mut self, event: WorkerEvent, reason: Option<String>) {
        let Some(next) = transition(self.state, event) else {
            debug!(stream_id = %self.ctx.stream_id, state = %self.state, event = event.as_str(), "Event ignored");
            return;
        };
        if next == self.state {
            return;
        }

        let previous = std::mem::replace(&mut self.state, next);
        publish_transition(&self.ctx, previous, next, event, reason);
    }
}

/// Records `previous -> next` on the status channel and emits
/// `stream_state_changed`. Entering `Error` is also sent to the notifier.
pub(super) fn publish_transition(
    ctx: &StreamContext,
    previous: StreamState,
    next: StreamState,
    event: WorkerEvent,
    reason: Option<String>,
) {
    ctx.status.send_modify(|s| s.state = next);
    info!(
        stream_id = %ctx.stream_id,
        from = %previous,
        to = %next,
        trigger = event.as_str(),
        "Stream state changed"
    );

    let state_event = ctx.event(
        EventType::StreamStateChanged,
        json!({
            "from": previous,
            "to": next,
            "trigger": event.as_str(),
            "reason": reason,
        }),
    );
    if next == StreamState::Error {
        ctx.hub.emit_and_notify(state_event);
    } else {
        ctx.hub.emit(state_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtzProtocol;
    use crate::testing::{test_context, wait_until, RecordingSink, Script, ScriptedConnector, StaticDetector};
    use camwatch_common::Event;

    #[test]
    fn transition_table() {
        use StreamState as S;
        use WorkerEvent as E;

        assert_eq!(transition(S::Idle, E::StartRequested), Some(S::Connecting));
        assert_eq!(transition(S::Error, E::StartRequested), Some(S::Connecting));
        assert_eq!(transition(S::Active, E::StartRequested), None);
        assert_eq!(transition(S::Connecting, E::FirstFrame), Some(S::Active));
        assert_eq!(transition(S::Connecting, E::LinkFailed), Some(S::Reconnecting));
        assert_eq!(transition(S::Active, E::StaleDetected), Some(S::Reconnecting));
        assert_eq!(transition(S::Active, E::LinkFailed), Some(S::Reconnecting));
        assert_eq!(transition(S::Reconnecting, E::FirstFrame), Some(S::Active));
        assert_eq!(transition(S::Reconnecting, E::CeilingReached), Some(S::Error));
        assert_eq!(transition(S::Active, E::CeilingReached), None);
        assert_eq!(transition(S::Idle, E::FirstFrame), None);
        for state in [S::Idle, S::Connecting, S::Active, S::Reconnecting, S::Error] {
            assert_eq!(transition(state, E::StopRequested), Some(S::Stopped));
        }
        assert_eq!(transition(S::Stopped, E::StopRequested), None);
    }

    fn worker(
        connector: Arc<ScriptedConnector>,
        sink: Arc<RecordingSink>,
        configure: impl FnOnce(&mut StreamConfig),
    ) -> (StreamWorker, StreamContext) {
        let (ctx, _status) = test_context("s1", sink);
        let mut config = StreamConfig::new(ctx.camera_id.clone(), "sim://lobby");
        config.backoff.base_delay_ms = 20;
        config.backoff.max_delay_ms = 1_000;
        config.detection_enabled = false;
        configure(&mut config);

        let ptz = Arc::new(PtzController::new(ctx.hub.clone(), ctx.metrics.clone()));
        let autotrack = Arc::new(Mutex::new(AutotrackCoordinator::new(ctx.clone(), &config, ptz.clone())));
        let deps = Collaborators {
            connector,
            detector: Arc::new(StaticDetector::default()),
            ptz,
            pipeline: PipelineConfig::default(),
            health_check_interval: Duration::from_millis(10),
        };
        (StreamWorker::new(ctx.clone(), config, autotrack, deps), ctx)
    }

    fn payload_u64(event: &Event, key: &str) -> Option<u64> {
        event.payload[key].as_u64()
    }

    #[tokio::test]
    async fn attempt_counter_resets_after_a_good_frame() {
        let connector = Arc::new(ScriptedConnector::new(
            vec![Script::Refuse, Script::Refuse, Script::Frames(2), Script::Refuse],
            Script::Live,
        ));
        let sink = Arc::new(RecordingSink::default());
        let (worker, ctx) = worker(connector.clone(), sink.clone(), |_| {});
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        assert!(wait_until(Duration::from_secs(3), || connector.opens() >= 5 && ctx.status.borrow().state == StreamState::Active).await);
        assert!(wait_until(Duration::from_secs(1), || sink.count(EventType::ReconnectionFailed) == 3).await);

        let failures = sink.events_of(EventType::ReconnectionFailed);
        let attempts: Vec<u64> = failures.iter().filter_map(|e| payload_u64(e, "attempt")).collect();
        assert_eq!(attempts, vec![1, 2, 1]);

        // the post-recovery failure waits about `base` again, not 4 * base
        let third_wait = payload_u64(&failures[2], "wait_ms").unwrap();
        assert!((15..=24).contains(&third_wait), "wait {}", third_wait);
        let second_wait = payload_u64(&failures[1], "wait_ms").unwrap();
        assert!((31..=48).contains(&second_wait), "wait {}", second_wait);

        assert_eq!(ctx.status.borrow().reconnect_attempt, 0);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(connector.live_links(), 0);
        assert_eq!(ctx.status.borrow().state, StreamState::Stopped);
    }

    #[tokio::test]
    async fn silent_link_is_replaced() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Stall], Script::Live));
        let sink = Arc::new(RecordingSink::default());
        let (worker, ctx) = worker(connector.clone(), sink.clone(), |config| {
            config.staleness_window_ms = 100;
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        assert!(wait_until(Duration::from_secs(2), || sink.count(EventType::StreamStale) == 1).await);
        assert!(wait_until(Duration::from_secs(1), || connector.opens() == 2 && ctx.status.borrow().state == StreamState::Active).await);
        assert_eq!(connector.max_live_links(), 1);
        assert_eq!(sink.count(EventType::ReconnectionFailed), 0);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(connector.live_links(), 0);
    }

    #[tokio::test]
    async fn cancel_is_prompt_while_ptz_attach_hangs() {
        let connector = Arc::new(ScriptedConnector::new(vec![], Script::Live).with_hanging_ptz());
        let sink = Arc::new(RecordingSink::default());
        let (worker, ctx) = worker(connector.clone(), sink.clone(), |config| {
            config.ptz.protocol = PtzProtocol::Onvif;
            config.connect_timeout_ms = 60_000;
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        assert!(wait_until(Duration::from_secs(1), || ctx.status.borrow().state == StreamState::Connecting).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("worker must not wait out the PTZ attach")
            .unwrap();

        assert_eq!(ctx.status.borrow().state, StreamState::Stopped);
        assert_eq!(connector.live_links(), 0);
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn connect_timeout_counts_as_failure() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Silent], Script::Live));
        let sink = Arc::new(RecordingSink::default());
        let (worker, ctx) = worker(connector.clone(), sink.clone(), |config| {
            config.connect_timeout_ms = 50;
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        assert!(wait_until(Duration::from_secs(2), || ctx.status.borrow().state == StreamState::Active).await);
        assert!(wait_until(Duration::from_secs(1), || sink.count(EventType::ReconnectionFailed) == 1).await);
        let failures = sink.events_of(EventType::ReconnectionFailed);
        assert!(failures[0].payload["error"].as_str().unwrap().contains("Timeout"));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(connector.live_links(), 0);
    }
}
