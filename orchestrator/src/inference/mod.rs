use camwatch_common::{sort_by_confidence, Detection, Frame};
use tracing::debug;

use crate::error::Result;

/// Object detection model. Called from a blocking thread by the detection
/// stage, one frame at a time per stream.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Drops detections that break the bbox or confidence invariants, stamps the
/// source frame sequence and orders by descending confidence.
pub fn normalize_detections(frame: &Frame, raw: Vec<Detection>) -> Vec<Detection> {
    let before = raw.len();
    let mut detections: Vec<Detection> = raw
        .into_iter()
        .filter(|d| d.bbox.is_normalized() && (0.0..=1.0).contains(&d.confidence))
        .map(|mut d| {
            d.frame_seq = frame.sequence;
            d
        })
        .collect();

    if detections.len() != before {
        debug!(
            frame_seq = frame.sequence,
            discarded = before - detections.len(),
            "Discarded malformed detections"
        );
    }

    sort_by_confidence(&mut detections);
    detections
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_common::BBox;
    use chrono::Utc;

    fn det(confidence: f32, bbox: BBox) -> Detection {
        Detection {
            class_label: "person".to_string(),
            confidence,
            bbox,
            frame_seq: 0,
        }
    }

    #[test]
    fn filters_sorts_and_stamps() {
        let frame = Frame::new(vec![0; 4], 2, 2, Utc::now(), 42);
        let raw = vec![
            det(0.4, BBox::new(0.1, 0.1, 0.3, 0.3)),
            det(0.9, BBox::new(0.5, 0.5, 0.6, 0.6)),
            det(0.8, BBox::new(0.7, 0.1, 0.6, 0.3)),
            det(1.3, BBox::new(0.1, 0.1, 0.3, 0.3)),
        ];

        let out = normalize_detections(&frame, raw);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].confidence, 0.4);
        assert!(out.iter().all(|d| d.frame_seq == 42));
    }
}
