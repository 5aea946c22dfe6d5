use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{OrchestratorError, Result};

pub struct Metrics {
    registry: Registry,
    frames_ingested: IntCounterVec,
    frames_dropped: IntCounterVec,
    detection_errors: IntCounterVec,
    reconnect_failures: IntCounterVec,
    ptz_commands: IntCounterVec,
    fanout_dropped: IntCounterVec,
    running_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("camwatch".to_string()), None)?;

        let frames_ingested = IntCounterVec::new(
            Opts::new("frames_ingested_total", "Frames read from camera links"),
            &["stream_id"],
        )?;
        let frames_dropped = IntCounterVec::new(
            Opts::new("frames_dropped_total", "Frames evicted from a full detection queue"),
            &["stream_id"],
        )?;
        let detection_errors = IntCounterVec::new(
            Opts::new("detection_errors_total", "Frames discarded after a detector failure"),
            &["stream_id"],
        )?;
        let reconnect_failures = IntCounterVec::new(
            Opts::new("reconnect_failures_total", "Failed connect/reconnect cycles"),
            &["stream_id"],
        )?;
        let ptz_commands = IntCounterVec::new(
            Opts::new("ptz_commands_total", "PTZ commands written to devices"),
            &["camera_id", "result"],
        )?;
        let fanout_dropped = IntCounterVec::new(
            Opts::new("events_dropped_total", "Events a consumer could not accept"),
            &["consumer"],
        )?;
        let running_workers = IntGauge::new("running_workers", "Stream workers currently alive")?;

        registry.register(Box::new(frames_ingested.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(detection_errors.clone()))?;
        registry.register(Box::new(reconnect_failures.clone()))?;
        registry.register(Box::new(ptz_commands.clone()))?;
        registry.register(Box::new(fanout_dropped.clone()))?;
        registry.register(Box::new(running_workers.clone()))?;

        Ok(Self {
            registry,
            frames_ingested,
            frames_dropped,
            detection_errors,
            reconnect_failures,
            ptz_commands,
            fanout_dropped,
            running_workers,
        })
    }

    pub fn record_frame(&self, stream_id: &str) {
        self.frames_ingested.with_label_values(&[stream_id]).inc();
    }

    pub fn record_frame_dropped(&self, stream_id: &str) {
        self.frames_dropped.with_label_values(&[stream_id]).inc();
    }

    pub fn record_detection_error(&self, stream_id: &str) {
        self.detection_errors.with_label_values(&[stream_id]).inc();
    }

    pub fn record_reconnect_failure(&self, stream_id: &str) {
        self.reconnect_failures.with_label_values(&[stream_id]).inc();
    }

    pub fn record_ptz_command(&self, camera_id: &str, ok: bool) {
        let result = if ok { "ok" } else { "failed" };
        self.ptz_commands.with_label_values(&[camera_id, result]).inc();
    }

    pub fn record_fanout_drop(&self, consumer: &str) {
        self.fanout_dropped.with_label_values(&[consumer]).inc();
    }

    pub fn worker_started(&self) {
        self.running_workers.inc();
    }

    pub fn worker_stopped(&self) {
        self.running_workers.dec();
    }

    pub fn running_workers(&self) -> i64 {
        self.running_workers.get()
    }

    pub fn frames_dropped(&self, stream_id: &str) -> u64 {
        self.frames_dropped.with_label_values(&[stream_id]).get()
    }

    pub fn reconnect_failures(&self, stream_id: &str) -> u64 {
        self.reconnect_failures.with_label_values(&[stream_id]).get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| OrchestratorError::ConfigError(format!("metrics: {}", e)))
    }
}
