use camwatch_common::{Detection, EventType};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::controller::PtzController;
use super::tracker::{TrackEvent, Tracker};
use super::types::{IntentKind, PtzPosition};
use crate::config::StreamConfig;
use crate::stream::StreamContext;

/// Per-stream switch between detection output and the PTZ controller.
pub struct AutotrackCoordinator {
    ctx: StreamContext,
    enabled: bool,
    tracker: Tracker,
    controller: Arc<PtzController>,
    home: PtzPosition,
    return_home_on_loss: bool,
    min_interval: Duration,
    last_move: Option<Instant>,
    moving: bool,
    /// True while a target is being followed.
    engaged: watch::Sender<bool>,
}

impl AutotrackCoordinator {
    pub fn new(ctx: StreamContext, config: &StreamConfig, controller: Arc<PtzController>) -> Self {
        Self {
            ctx,
            enabled: config.autotrack_enabled,
            tracker: Tracker::new(config.tracker.clone(), config.target_classes.clone()),
            controller,
            home: config.ptz.home,
            return_home_on_loss: config.tracker.return_home_on_loss,
            min_interval: Duration::from_millis(config.tracker.min_command_interval_ms),
            last_move: None,
            moving: false,
            engaged: watch::channel(false).0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Follows whether autotrack currently holds a target.
    pub fn engaged(&self) -> watch::Receiver<bool> {
        self.engaged.subscribe()
    }

    fn set_engaged(&self, engaged: bool) {
        self.engaged
            .send_if_modified(|current| std::mem::replace(current, engaged) != engaged);
    }

    /// Enabling starts from an empty track. Disabling sends the camera home
    /// once and then stays silent. Returns whether the switch changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }

        self.enabled = enabled;
        self.tracker.reset();
        self.last_move = None;
        self.moving = false;
        self.set_engaged(false);

        if !enabled {
            self.command(IntentKind::Absolute(self.home));
        }

        self.ctx.status.send_modify(|s| s.autotrack_enabled = enabled);
        self.ctx
            .emit(EventType::AutotrackToggled, json!({ "enabled": enabled }));
        info!(stream_id = %self.ctx.stream_id, enabled, "Autotrack toggled");
        true
    }

    /// Feeds one frame's confidence-filtered detections through the tracker.
    pub fn on_detections(&mut self, frame_seq: u64, detections: &[Detection]) {
        if !self.enabled {
            return;
        }

        let output = self.tracker.update(detections);

        match output.event {
            Some(TrackEvent::Acquired {
                target_id,
                class_label,
                confidence,
            }) => {
                self.set_engaged(true);
                self.ctx.emit(
                    EventType::TargetAcquired,
                    json!({
                        "target_id": target_id,
                        "class_label": class_label,
                        "confidence": confidence,
                        "frame_seq": frame_seq,
                    }),
                );
            }
            Some(TrackEvent::Lost { target_id }) => {
                self.ctx.emit(
                    EventType::TargetLost,
                    json!({ "target_id": target_id, "frame_seq": frame_seq }),
                );
                if self.return_home_on_loss {
                    self.command(IntentKind::Absolute(self.home));
                } else if self.moving {
                    self.command(IntentKind::Stop);
                }
                self.moving = false;
                self.last_move = None;
                self.set_engaged(false);
            }
            None => {}
        }

        let Some(movement) = output.movement else {
            return;
        };

        if movement.is_zero() {
            if self.moving {
                self.command(IntentKind::Stop);
                self.moving = false;
            }
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_move {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }
        if self.command(movement) {
            self.last_move = Some(now);
            self.moving = true;
        }
    }

    fn command(&self, kind: IntentKind) -> bool {
        match self.controller.move_camera(&self.ctx.camera_id, kind) {
            Ok(sequence) => {
                debug!(stream_id = %self.ctx.stream_id, sequence, ?kind, "Autotrack intent issued");
                true
            }
            Err(e) => {
                debug!(stream_id = %self.ctx.stream_id, error = %e, "Autotrack intent not delivered");
                false
            }
        }
    }
}
