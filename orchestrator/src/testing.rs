//! In-memory cameras, PTZ heads, detectors and event recorders for unit tests.

use async_trait::async_trait;
use camwatch_common::{BBox, Detection, Event, EventType, Frame, StreamStatus};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::camera::{CameraConnector, CameraLink, PtzDevice, RawFrame};
use crate::config::{PtzProtocol, StreamConfig};
use crate::error::{OrchestratorError, Result};
use crate::inference::Detector;
use crate::messaging::{EventHub, EventSink, Notifier};
use crate::metrics::Metrics;
use crate::ptz::MovementIntent;
use crate::stream::StreamContext;

/// Behaviour of one `open` call on a [`ScriptedConnector`].
#[derive(Debug, Clone)]
pub enum Script {
    /// `open` fails.
    Refuse,
    /// Delivers `n` frames in total, then the read fails.
    Frames(usize),
    /// One frame, then reads never complete.
    Stall,
    /// Opens, but no frame ever arrives.
    Silent,
    /// Endless frames, 5 ms apart.
    Live,
}

#[derive(Default)]
struct LinkCounters {
    opens: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    counters: Arc<LinkCounters>,
    ptz: Option<Arc<RecordingPtz>>,
    ptz_hangs: bool,
}

impl ScriptedConnector {
    /// Plays `scripts` in order, then `fallback` for every later open.
    pub fn new(scripts: Vec<Script>, fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            counters: Arc::new(LinkCounters::default()),
            ptz: None,
            ptz_hangs: false,
        }
    }

    pub fn with_ptz(mut self, device: Arc<RecordingPtz>) -> Self {
        self.ptz = Some(device);
        self
    }

    /// `open_ptz` never resolves.
    pub fn with_hanging_ptz(mut self) -> Self {
        self.ptz_hangs = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn live_links(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live_links(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraConnector for ScriptedConnector {
    async fn open(&self, _source_uri: &str) -> Result<Box<dyn CameraLink>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Script::Refuse = script {
            return Err(OrchestratorError::ConnectError("connection refused".to_string()));
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedLink {
            script,
            delivered: 0,
            counters: self.counters.clone(),
        }))
    }

    async fn open_ptz(&self, config: &StreamConfig) -> Result<Option<Arc<dyn PtzDevice>>> {
        if config.ptz.protocol == PtzProtocol::None {
            return Ok(None);
        }
        if self.ptz_hangs {
            return std::future::pending().await;
        }
        Ok(self.ptz.clone().map(|device| device as Arc<dyn PtzDevice>))
    }
}

struct ScriptedLink {
    script: Script,
    delivered: usize,
    counters: Arc<LinkCounters>,
}

impl ScriptedLink {
    fn frame(&mut self) -> RawFrame {
        self.delivered += 1;
        RawFrame {
            data: vec![0; 16],
            width: 4,
            height: 4,
            captured_at: Utc::now(),
        }
    }
}

#[async_trait]
impl CameraLink for ScriptedLink {
    async fn read_frame(&mut self) -> Result<RawFrame> {
        match self.script {
            Script::Frames(n) if self.delivered >= n => {
                Err(OrchestratorError::IoError("stream ended".to_string()))
            }
            Script::Frames(_) => {
                if self.delivered > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(self.frame())
            }
            Script::Stall if self.delivered > 0 => std::future::pending::<Result<RawFrame>>().await,
            Script::Stall => Ok(self.frame()),
            Script::Silent => std::future::pending::<Result<RawFrame>>().await,
            Script::Live => {
                if self.delivered > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(self.frame())
            }
            Script::Refuse => Err(OrchestratorError::IoError("refused link".to_string())),
        }
    }

    async fn close(&mut self) {}
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// PTZ head that records every command it executes.
#[derive(Default)]
pub struct RecordingPtz {
    commands: Mutex<Vec<MovementIntent>>,
    latency: Duration,
    fail: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingPtz {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<MovementIntent> {
        self.commands.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PtzDevice for RecordingPtz {
    async fn send_command(&self, intent: &MovementIntent) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(OrchestratorError::CommandError("head unreachable".to_string()));
        }
        self.commands.lock().unwrap().push(intent.clone());
        Ok(())
    }
}

/// Returns the same detections for every frame. The default is one person
/// centred in view at the tracker's default fill ratio.
pub struct StaticDetector {
    detections: Vec<Detection>,
}

impl Default for StaticDetector {
    fn default() -> Self {
        Self {
            detections: vec![Detection {
                class_label: "person".to_string(),
                confidence: 0.9,
                bbox: BBox::new(0.34, 0.34, 0.66, 0.66),
                frame_seq: 0,
            }],
        }
    }
}

impl Detector for StaticDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}

/// Captures everything routed to it, as sink and as notifier.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    notified: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn notified_count(&self, event_type: EventType) -> usize {
        self.notified
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[async_trait]
impl Notifier for RecordingSink {
    async fn notify(&self, event: &Event) -> Result<()> {
        self.notified.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Polls `condition` every 5 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn test_hub(sink: Arc<RecordingSink>, metrics: Arc<Metrics>) -> EventHub {
    EventHub::builder(1024)
        .sink("recorder", sink.clone())
        .notifier("recorder", sink)
        .build(metrics)
}

pub fn test_context(stream_id: &str, sink: Arc<RecordingSink>) -> (StreamContext, watch::Receiver<StreamStatus>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let (status, rx) = watch::channel(StreamStatus::new(stream_id, "cam-1", false));
    let ctx = StreamContext {
        stream_id: stream_id.to_string(),
        camera_id: "cam-1".to_string(),
        hub: test_hub(sink, metrics.clone()),
        metrics,
        status: Arc::new(status),
    };
    (ctx, rx)
}
