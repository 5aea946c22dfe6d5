use camwatch_common::{BBox, Detection, Frame};
use camwatch_orchestrator::{Detector, OrchestratorError, Result};
use rand::prelude::*;

use crate::scene::SceneFrame;

/// Detector that reads the scene's ground truth out of the frame and degrades
/// it the way a real model would: jittered boxes and confidences, misses,
/// spurious boxes and the occasional hard failure.
pub struct NoisyDetector {
    miss_rate: f64,
    failure_rate: f64,
    garbage_rate: f64,
}

impl NoisyDetector {
    pub fn new(miss_rate: f64, failure_rate: f64, garbage_rate: f64) -> Self {
        Self {
            miss_rate,
            failure_rate,
            garbage_rate,
        }
    }
}

impl Default for NoisyDetector {
    fn default() -> Self {
        Self::new(0.05, 0.01, 0.02)
    }
}

impl Detector for NoisyDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut rng = thread_rng();
        if rng.gen_bool(self.failure_rate) {
            return Err(OrchestratorError::DetectionError(format!(
                "inference failed on frame {}",
                frame.sequence
            )));
        }

        let scene: SceneFrame = serde_json::from_slice(&frame.data)
            .map_err(|e| OrchestratorError::DetectionError(format!("undecodable frame: {}", e)))?;

        let mut detections = Vec::with_capacity(scene.objects.len());
        for mut detection in scene.objects {
            if rng.gen_bool(self.miss_rate) {
                continue;
            }
            let bbox = detection.bbox;
            detection.bbox = BBox::new(
                (bbox.xmin + rng.gen_range(-0.005..0.005)).max(0.0),
                (bbox.ymin + rng.gen_range(-0.005..0.005)).max(0.0),
                (bbox.xmax + rng.gen_range(-0.005..0.005)).min(1.0),
                (bbox.ymax + rng.gen_range(-0.005..0.005)).min(1.0),
            );
            detection.confidence = rng.gen_range(0.55..0.98);
            detections.push(detection);
        }

        // malformed output the pipeline is expected to discard
        if rng.gen_bool(self.garbage_rate) {
            detections.push(Detection {
                class_label: "person".to_string(),
                confidence: 1.7,
                bbox: BBox::new(0.6, 0.2, 0.4, 1.3),
                frame_seq: frame.sequence,
            });
        }

        Ok(detections)
    }
}
