use camwatch_common::utils::format_duration;
use camwatch_common::EventType;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::StreamContext;

/// Frame liveness shared between a stream's ingestion loop and its monitor.
/// Only armed while the stream is `Active`.
#[derive(Clone)]
pub struct Heartbeat {
    origin: Instant,
    last_beat_ms: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_beat_ms: Arc::new(AtomicU64::new(0)),
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn beat(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_beat_ms.store(now, Ordering::Release);
    }

    pub fn arm(&self) {
        self.beat();
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn since_last_beat(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_beat_ms.load(Ordering::Acquire)))
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream staleness watchdog.
///
/// When an armed heartbeat goes quiet for longer than the staleness window,
/// it emits `stream_stale`, disarms, and wakes the ingestion loop through
/// `stale` so the worker abandons the link and reconnects.
pub struct HealthMonitor {
    ctx: StreamContext,
    heartbeat: Heartbeat,
    stale: Arc<Notify>,
    window: Duration,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        ctx: StreamContext,
        heartbeat: Heartbeat,
        stale: Arc<Notify>,
        window: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            heartbeat,
            stale,
            window,
            check_interval: check_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            stream_id = %self.ctx.stream_id,
            window = %format_duration(self.window),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check(),
            }
        }

        debug!(stream_id = %self.ctx.stream_id, "Health monitor stopped");
    }

    fn check(&self) {
        if !self.heartbeat.is_armed() {
            return;
        }
        let silent = self.heartbeat.since_last_beat();
        if silent <= self.window {
            return;
        }

        self.heartbeat.disarm();
        warn!(
            stream_id = %self.ctx.stream_id,
            silent = %format_duration(silent),
            "No frames within staleness window, forcing reconnect"
        );
        self.ctx.emit(
            EventType::StreamStale,
            json!({
                "silent_ms": silent.as_millis() as u64,
                "staleness_window_ms": self.window.as_millis() as u64,
            }),
        );
        self.stale.notify_one();
    }
}
