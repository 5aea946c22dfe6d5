use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bounding box in normalized image coordinates (0.0 - 1.0).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.xmin + self.width() / 2.0,
            self.ymin + self.height() / 2.0,
        )
    }

    /// `0 <= xmin < xmax <= 1` and `0 <= ymin < ymax <= 1`.
    pub fn is_normalized(&self) -> bool {
        0.0 <= self.xmin
            && self.xmin < self.xmax
            && self.xmax <= 1.0
            && 0.0 <= self.ymin
            && self.ymin < self.ymax
            && self.ymax <= 1.0
    }

    pub fn center_distance(&self, point: (f32, f32)) -> f32 {
        let (cx, cy) = self.center();
        ((cx - point.0).powi(2) + (cy - point.1).powi(2)).sqrt()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Sequence number of the frame this detection came from.
    pub frame_seq: u64,
}

/// Sorts detections by descending confidence. The sort is stable, so equal
/// confidences keep the detector's order.
pub fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// A captured video frame. The pixel buffer is shared, so clones are cheap and
/// no stage can mutate what another stage sees.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, captured_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            data: Arc::from(data),
            width,
            height,
            captured_at,
            sequence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Stopped,
    Error,
}

impl StreamState {
    /// States in which a worker owns (or is acquiring) the camera link.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active | Self::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FrameDropped,
    ReconnectionFailed,
    DetectionError,
    PtzCommandFailed,
    Detection,
    StreamStateChanged,
    StreamStale,
    TargetAcquired,
    TargetLost,
    AutotrackToggled,
    PatrolToggled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrameDropped => "frame_dropped",
            Self::ReconnectionFailed => "reconnection_failed",
            Self::DetectionError => "detection_error",
            Self::PtzCommandFailed => "ptz_command_failed",
            Self::Detection => "detection",
            Self::StreamStateChanged => "stream_state_changed",
            Self::StreamStale => "stream_stale",
            Self::TargetAcquired => "target_acquired",
            Self::TargetLost => "target_lost",
            Self::AutotrackToggled => "autotrack_toggled",
            Self::PatrolToggled => "patrol_toggled",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational event handed to the logging sink and notification dispatcher.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub stream_id: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        stream_id: impl Into<String>,
        camera_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            stream_id: stream_id.into(),
            camera_id: camera_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Status payload exposed to the API layer for one stream.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamStatus {
    pub stream_id: String,
    pub camera_id: String,
    pub state: StreamState,
    pub last_frame_at: Option<DateTime<Utc>>,
    /// Consecutive failed connect/reconnect cycles.
    pub reconnect_attempt: u32,
    /// Wait before the next reconnect, if one is pending.
    pub backoff_ms: Option<u64>,
    pub autotrack_enabled: bool,
    /// Whether a patrol sweep is running for this stream's camera.
    pub patrol_active: bool,
    pub last_error: Option<String>,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub detection_errors: u64,
    pub fps: f32,
}

impl StreamStatus {
    pub fn new(stream_id: impl Into<String>, camera_id: impl Into<String>, autotrack_enabled: bool) -> Self {
        Self {
            stream_id: stream_id.into(),
            camera_id: camera_id.into(),
            state: StreamState::Idle,
            last_frame_at: None,
            reconnect_attempt: 0,
            backoff_ms: None,
            autotrack_enabled,
            patrol_active: false,
            last_error: None,
            frames_received: 0,
            frames_dropped: 0,
            detection_errors: 0,
            fps: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(confidence: f32) -> Detection {
        Detection {
            class_label: "person".to_string(),
            confidence,
            bbox: BBox::new(0.1, 0.1, 0.2, 0.2),
            frame_seq: 1,
        }
    }

    #[test]
    fn bbox_geometry() {
        let bbox = BBox::new(0.2, 0.4, 0.6, 0.6);
        assert!((bbox.area() - 0.08).abs() < 1e-6);
        let (cx, cy) = bbox.center();
        assert!((cx - 0.4).abs() < 1e-6);
        assert!((cy - 0.5).abs() < 1e-6);
        assert!(bbox.is_normalized());
    }

    #[test]
    fn bbox_rejects_degenerate_and_out_of_range() {
        assert!(!BBox::new(0.5, 0.1, 0.5, 0.2).is_normalized());
        assert!(!BBox::new(0.1, 0.1, 1.2, 0.2).is_normalized());
        assert!(!BBox::new(-0.1, 0.1, 0.2, 0.2).is_normalized());
    }

    #[test]
    fn sorts_descending_by_confidence() {
        let mut dets = vec![detection(0.3), detection(0.9), detection(0.6)];
        sort_by_confidence(&mut dets);
        let confs: Vec<f32> = dets.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.6, 0.3]);
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let event = Event::new(
            EventType::ReconnectionFailed,
            "s1",
            "c1",
            serde_json::json!({ "attempt": 2 }),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "reconnection_failed");
        assert_eq!(value["payload"]["attempt"], 2);
    }

    #[test]
    fn running_states() {
        assert!(StreamState::Reconnecting.is_running());
        assert!(!StreamState::Error.is_running());
        assert!(!StreamState::Stopped.is_running());
    }
}
