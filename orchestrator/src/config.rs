use camwatch_common::utils::validate_source_uri;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{OrchestratorError, Result};
use crate::ptz::PtzPosition;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub streams: Vec<StreamConfig>,
    pub pipeline: PipelineConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

/// Per-stream configuration accepted at registration.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct StreamConfig {
    /// Registry key. Generated when absent.
    pub stream_id: Option<String>,
    #[validate(length(min = 1, message = "camera_id must not be empty"))]
    pub camera_id: String,
    pub name: String,
    #[validate(custom = "check_source_uri")]
    pub source_uri: String,
    pub detection_enabled: bool,
    pub autotrack_enabled: bool,
    /// Minimum confidence for a detection to become an event.
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,
    /// Event class allow-list; empty allows every class.
    pub allowed_classes: Vec<String>,
    /// Classes the tracker may follow.
    pub target_classes: Vec<String>,
    #[validate(range(min = 1))]
    pub staleness_window_ms: u64,
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    /// Minimum gap between two notifications for this stream.
    pub notification_cooldown_ms: u64,
    /// Frames closer than this to the last detected frame skip detection.
    pub detection_interval_ms: u64,
    #[validate]
    pub backoff: BackoffConfig,
    pub ptz: PtzConfig,
    #[validate]
    pub tracker: TrackerConfig,
    #[validate]
    pub patrol: PatrolConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct BackoffConfig {
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_ratio: f64,
    /// Consecutive failures after which the stream parks in `Error`.
    /// `None` retries forever.
    #[validate(range(min = 1))]
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PtzProtocol {
    None,
    Onvif,
    Tapo,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PtzConfig {
    pub protocol: PtzProtocol,
    pub endpoint: Option<String>,
    pub home: PtzPosition,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct TrackerConfig {
    /// Centre offset (normalized) below which no pan/tilt is issued.
    #[validate(range(min = 0.0, max = 0.5))]
    pub deadband: f32,
    #[validate(range(min = 0.0))]
    pub pan_gain: f32,
    #[validate(range(min = 0.0))]
    pub tilt_gain: f32,
    /// Largest movement per control tick on any axis.
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_step: f32,
    /// Largest centroid jump still associated with the current target.
    #[validate(range(min = 0.0, max = 1.5))]
    pub association_radius: f32,
    /// Frames without a match before the target counts as lost.
    pub lost_after_frames: u32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub velocity_smoothing: f32,
    pub zoom_enabled: bool,
    #[validate(range(min = 0.0, max = 1.0))]
    pub desired_fill_ratio: f32,
    #[validate(range(min = 0.0))]
    pub zoom_gain: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub zoom_deadband: f32,
    pub min_command_interval_ms: u64,
    pub return_home_on_loss: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatrolDirection {
    /// Rows top to bottom, alternating left/right.
    Horizontal,
    /// Columns left to right, alternating up/down.
    Vertical,
}

/// Grid sweep over a PTZ camera's patrol area.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct PatrolConfig {
    #[validate(range(min = -1.0, max = 1.0))]
    pub pan_min: f32,
    #[validate(range(min = -1.0, max = 1.0))]
    pub pan_max: f32,
    #[validate(range(min = -1.0, max = 1.0))]
    pub tilt_min: f32,
    #[validate(range(min = -1.0, max = 1.0))]
    pub tilt_max: f32,
    #[validate(range(min = 1, max = 32))]
    pub columns: u32,
    #[validate(range(min = 1, max = 32))]
    pub rows: u32,
    pub direction: PatrolDirection,
    #[validate(range(min = 0.0, max = 1.0))]
    pub zoom: f32,
    /// Time spent at each grid position.
    pub dwell_ms: u64,
    /// Time spent at home between two sweeps.
    pub home_rest_ms: u64,
    /// Longest pause while autotrack holds a target before the sweep resumes.
    pub max_pause_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the ingestion -> detection queue. Overflow drops the oldest frame.
    pub frame_queue_capacity: usize,
    /// Capacity of the detection -> event processor channel.
    pub event_queue_capacity: usize,
    /// Per-consumer buffer in the event fan-out.
    pub fanout_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub metrics_port: u16,
    pub health_check_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

fn check_source_uri(uri: &str) -> std::result::Result<(), ValidationError> {
    validate_source_uri(uri).map_err(|msg| {
        let mut error = ValidationError::new("source_uri");
        error.message = Some(Cow::from(msg));
        error
    })
}

impl StreamConfig {
    pub fn new(camera_id: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            source_uri: source_uri.into(),
            ..Self::default()
        }
    }

    /// Field ranges plus the cross-field rules the derive cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(OrchestratorError::ConfigError(format!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        if let Some(id) = &self.stream_id {
            if id.trim().is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "stream_id must not be blank".to_string(),
                ));
            }
        }
        // range checks let NaN through
        let tracker = &self.tracker;
        let patrol = &self.patrol;
        let floats = [
            tracker.pan_gain,
            tracker.tilt_gain,
            tracker.zoom_gain,
            tracker.zoom_deadband,
            patrol.pan_min,
            patrol.pan_max,
            patrol.tilt_min,
            patrol.tilt_max,
            patrol.zoom,
        ];
        if floats.iter().any(|value| !value.is_finite()) {
            return Err(OrchestratorError::ConfigError(
                "tracker gains and patrol bounds must be finite numbers".to_string(),
            ));
        }
        if self.patrol.pan_min > self.patrol.pan_max || self.patrol.tilt_min > self.patrol.tilt_max {
            return Err(OrchestratorError::ConfigError(
                "patrol area minimum exceeds its maximum".to_string(),
            ));
        }
        if self.autotrack_enabled {
            self.check_autotrack_capable()?;
        }
        Ok(())
    }

    pub fn check_patrol_capable(&self) -> Result<()> {
        if self.ptz.protocol == PtzProtocol::None {
            return Err(OrchestratorError::ConfigError(
                "patrol requires a PTZ protocol".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_autotrack_capable(&self) -> Result<()> {
        if !self.detection_enabled {
            return Err(OrchestratorError::ConfigError(
                "autotrack requires detection_enabled".to_string(),
            ));
        }
        if self.ptz.protocol == PtzProtocol::None {
            return Err(OrchestratorError::ConfigError(
                "autotrack requires a PTZ protocol".to_string(),
            ));
        }
        if self.target_classes.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "autotrack requires at least one target class".to_string(),
            ));
        }
        Ok(())
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_millis(self.notification_cooldown_ms)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }
}

impl NodeConfig {
    /// Loads a config file (any format the `config` crate knows) and applies
    /// `CAMWATCH_*` environment overrides (`__` separates nested keys).
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("CAMWATCH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let node: NodeConfig = settings.try_deserialize()?;
        node.check()?;
        Ok(node)
    }

    pub fn check(&self) -> Result<()> {
        if self.pipeline.frame_queue_capacity == 0 || self.pipeline.event_queue_capacity == 0 {
            return Err(OrchestratorError::ConfigError(
                "pipeline queue capacities must be at least 1".to_string(),
            ));
        }
        if self.pipeline.fanout_capacity == 0 {
            return Err(OrchestratorError::ConfigError(
                "pipeline.fanout_capacity must be at least 1".to_string(),
            ));
        }
        if self.monitoring.health_check_interval_ms == 0 {
            return Err(OrchestratorError::ConfigError(
                "monitoring.health_check_interval_ms must be at least 1".to_string(),
            ));
        }
        self.streams.iter().try_for_each(StreamConfig::check)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.health_check_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: None,
            camera_id: String::new(),
            name: String::new(),
            source_uri: String::new(),
            detection_enabled: true,
            autotrack_enabled: false,
            confidence_threshold: 0.5,
            allowed_classes: vec![],
            target_classes: vec!["person".to_string()],
            staleness_window_ms: 5_000,
            connect_timeout_ms: 10_000,
            notification_cooldown_ms: 30_000,
            detection_interval_ms: 0,
            backoff: BackoffConfig::default(),
            ptz: PtzConfig::default(),
            tracker: TrackerConfig::default(),
            patrol: PatrolConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            max_consecutive_failures: None,
        }
    }
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            protocol: PtzProtocol::None,
            endpoint: None,
            home: PtzPosition::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            deadband: 0.05,
            pan_gain: 0.8,
            tilt_gain: 0.8,
            max_step: 0.5,
            association_radius: 0.2,
            lost_after_frames: 15,
            velocity_smoothing: 0.5,
            zoom_enabled: true,
            desired_fill_ratio: 0.1,
            zoom_gain: 0.5,
            zoom_deadband: 0.02,
            min_command_interval_ms: 200,
            return_home_on_loss: true,
        }
    }
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            pan_min: -0.5,
            pan_max: 0.5,
            tilt_min: -0.3,
            tilt_max: 0.3,
            columns: 4,
            rows: 3,
            direction: PatrolDirection::Horizontal,
            zoom: 0.3,
            dwell_ms: 2_000,
            home_rest_ms: 60_000,
            max_pause_ms: 30_000,
        }
    }
}

impl PatrolConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn home_rest(&self) -> Duration {
        Duration::from_millis(self.home_rest_ms)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 16,
            event_queue_capacity: 32,
            fanout_capacity: 1024,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 9090,
            health_check_interval_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
