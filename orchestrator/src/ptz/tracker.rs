//! Proportional visual-servo loop: keeps one selected target centred.
//!
//! Image coordinates are normalized with the origin top-left, so a target
//! below centre needs a negative tilt.

use camwatch_common::{BBox, Detection};
use std::cmp::Ordering;

use super::types::IntentKind;
use crate::config::TrackerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTarget {
    pub id: u64,
    pub class_label: String,
    pub bbox: BBox,
    pub center: (f32, f32),
    /// Smoothed centroid displacement per frame.
    pub velocity: (f32, f32),
    pub frames_since_seen: u32,
}

impl TrackedTarget {
    fn predicted_center(&self) -> (f32, f32) {
        (
            self.center.0 + self.velocity.0,
            self.center.1 + self.velocity.1,
        )
    }
}

#[derive(Debug, Default)]
pub struct TrackState {
    pub target: Option<TrackedTarget>,
    next_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Acquired { target_id: u64, class_label: String, confidence: f32 },
    Lost { target_id: u64 },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrackerOutput {
    pub event: Option<TrackEvent>,
    /// Relative move for this frame. `None` when there is nothing to follow.
    pub movement: Option<IntentKind>,
}

pub struct Tracker {
    config: TrackerConfig,
    target_classes: Vec<String>,
    state: TrackState,
}

/// Highest confidence wins; equal confidence goes to the larger box.
pub fn select_target<'a>(candidates: &[&'a Detection]) -> Option<&'a Detection> {
    candidates.iter().copied().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.bbox
                    .area()
                    .partial_cmp(&b.bbox.area())
                    .unwrap_or(Ordering::Equal)
            })
    })
}

impl Tracker {
    pub fn new(config: TrackerConfig, target_classes: Vec<String>) -> Self {
        Self {
            config,
            target_classes,
            state: TrackState::default(),
        }
    }

    pub fn state(&self) -> &TrackState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.target = None;
    }

    /// Consumes the detections of one frame, in frame order.
    pub fn update(&mut self, detections: &[Detection]) -> TrackerOutput {
        let candidates: Vec<&Detection> = detections
            .iter()
            .filter(|d| self.is_target_class(&d.class_label))
            .collect();

        match self.state.target.take() {
            Some(target) => self.follow(target, &candidates),
            None => self.acquire(&candidates),
        }
    }

    fn acquire(&mut self, candidates: &[&Detection]) -> TrackerOutput {
        let Some(chosen) = select_target(candidates) else {
            return TrackerOutput::default();
        };

        self.state.next_id += 1;
        let target = TrackedTarget {
            id: self.state.next_id,
            class_label: chosen.class_label.clone(),
            bbox: chosen.bbox,
            center: chosen.bbox.center(),
            velocity: (0.0, 0.0),
            frames_since_seen: 0,
        };
        let movement = self.compute_movement(&target.bbox);
        let event = TrackEvent::Acquired {
            target_id: target.id,
            class_label: target.class_label.clone(),
            confidence: chosen.confidence,
        };
        self.state.target = Some(target);

        TrackerOutput {
            event: Some(event),
            movement: Some(movement),
        }
    }

    fn follow(&mut self, mut target: TrackedTarget, candidates: &[&Detection]) -> TrackerOutput {
        let predicted = target.predicted_center();
        let matched = candidates
            .iter()
            .map(|d| (d, d.bbox.center_distance(predicted)))
            .filter(|(_, distance)| *distance <= self.config.association_radius)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(d, _)| *d);

        match matched {
            Some(detection) => {
                let center = detection.bbox.center();
                let alpha = self.config.velocity_smoothing;
                target.velocity = (
                    alpha * (center.0 - target.center.0) + (1.0 - alpha) * target.velocity.0,
                    alpha * (center.1 - target.center.1) + (1.0 - alpha) * target.velocity.1,
                );
                target.center = center;
                target.bbox = detection.bbox;
                target.frames_since_seen = 0;

                let movement = self.compute_movement(&target.bbox);
                self.state.target = Some(target);
                TrackerOutput {
                    event: None,
                    movement: Some(movement),
                }
            }
            None => {
                target.frames_since_seen += 1;
                if target.frames_since_seen > self.config.lost_after_frames {
                    return TrackerOutput {
                        event: Some(TrackEvent::Lost { target_id: target.id }),
                        movement: None,
                    };
                }
                self.state.target = Some(target);
                TrackerOutput::default()
            }
        }
    }

    /// Relative pan/tilt/zoom that moves `bbox` toward centre and the desired
    /// fill. Zero on every axis inside its deadband.
    pub fn compute_movement(&self, bbox: &BBox) -> IntentKind {
        let config = &self.config;
        let (cx, cy) = bbox.center();
        let dx = cx - 0.5;
        let dy = cy - 0.5;

        let pan = if dx.abs() <= config.deadband {
            0.0
        } else {
            config.pan_gain * dx * 2.0
        };
        let tilt = if dy.abs() <= config.deadband {
            0.0
        } else {
            -config.tilt_gain * dy * 2.0
        };

        let zoom = if config.zoom_enabled && config.desired_fill_ratio > 0.0 {
            let deficit = config.desired_fill_ratio - bbox.area();
            if deficit.abs() <= config.zoom_deadband {
                0.0
            } else {
                config.zoom_gain * deficit / config.desired_fill_ratio
            }
        } else {
            0.0
        };

        let step = config.max_step;
        IntentKind::relative(
            pan.clamp(-step, step),
            tilt.clamp(-step, step),
            zoom.clamp(-step, step),
        )
    }

    fn is_target_class(&self, label: &str) -> bool {
        self.target_classes.is_empty() || self.target_classes.iter().any(|c| c == label)
    }
}
