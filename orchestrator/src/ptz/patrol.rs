use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::PtzController;
use super::types::{IntentKind, PtzPosition};
use crate::config::{PatrolConfig, PatrolDirection, StreamConfig};
use crate::stream::StreamContext;

/// Grid positions of one sweep, in visiting order.
///
/// Horizontal sweeps walk rows from the top of the area down and reverse
/// direction on every row; vertical sweeps do the same with columns, left to
/// right. A single column or row sits at the area's minimum pan or top tilt.
pub fn grid_waypoints(config: &PatrolConfig) -> Vec<PtzPosition> {
    let columns = config.columns.max(1);
    let rows = config.rows.max(1);
    let step = |span: f32, count: u32| if count > 1 { span / (count - 1) as f32 } else { 0.0 };
    let pan_step = step(config.pan_max - config.pan_min, columns);
    let tilt_step = step(config.tilt_max - config.tilt_min, rows);

    let at = |column: u32, row: u32| PtzPosition {
        pan: (config.pan_min + column as f32 * pan_step).min(config.pan_max),
        tilt: (config.tilt_max - row as f32 * tilt_step).max(config.tilt_min),
        zoom: config.zoom,
    };

    let mut waypoints = Vec::with_capacity((columns * rows) as usize);
    match config.direction {
        PatrolDirection::Horizontal => {
            for row in 0..rows {
                let forward = row % 2 == 0;
                for i in 0..columns {
                    let column = if forward { i } else { columns - 1 - i };
                    waypoints.push(at(column, row));
                }
            }
        }
        PatrolDirection::Vertical => {
            for column in 0..columns {
                let forward = column % 2 == 0;
                for i in 0..rows {
                    let row = if forward { i } else { rows - 1 - i };
                    waypoints.push(at(column, row));
                }
            }
        }
    }
    waypoints
}

/// Sweeps one camera over its patrol grid until cancelled: every waypoint is
/// held for the dwell time, and each completed sweep ends with a rest at
/// home. Moves go through the camera's PTZ writer, so autotrack and manual
/// commands still supersede them. While autotrack holds a target the sweep
/// waits, up to `max_pause`.
pub struct Patrol {
    ctx: StreamContext,
    config: PatrolConfig,
    home: PtzPosition,
    controller: Arc<PtzController>,
    engaged: watch::Receiver<bool>,
}

impl Patrol {
    pub fn new(
        ctx: StreamContext,
        config: &StreamConfig,
        controller: Arc<PtzController>,
        engaged: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            config: config.patrol.clone(),
            home: config.ptz.home,
            controller,
            engaged,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let waypoints = grid_waypoints(&self.config);
        info!(
            stream_id = %self.ctx.stream_id,
            camera_id = %self.ctx.camera_id,
            waypoints = waypoints.len(),
            direction = ?self.config.direction,
            "Patrol started"
        );

        let mut sweeps: u64 = 0;
        'patrol: loop {
            for (index, waypoint) in waypoints.iter().enumerate() {
                if !self.hold_while_engaged(&cancel).await {
                    break 'patrol;
                }
                debug!(stream_id = %self.ctx.stream_id, index, ?waypoint, "Patrol moving");
                self.command(IntentKind::Absolute(*waypoint));
                if !self.dwell(&cancel).await {
                    break 'patrol;
                }
            }

            sweeps += 1;
            debug!(stream_id = %self.ctx.stream_id, sweeps, "Patrol sweep complete, resting at home");
            self.command(IntentKind::Absolute(self.home));
            if !sleep_or_cancel(self.config.home_rest(), &cancel).await {
                break;
            }
        }

        info!(stream_id = %self.ctx.stream_id, sweeps, "Patrol stopped");
    }

    /// Waits while autotrack follows a target. Returns false once cancelled.
    async fn hold_while_engaged(&mut self, cancel: &CancellationToken) -> bool {
        if !*self.engaged.borrow_and_update() {
            return !cancel.is_cancelled();
        }

        debug!(stream_id = %self.ctx.stream_id, "Patrol paused while a target is tracked");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = wait_for(&mut self.engaged, false) => {
                debug!(stream_id = %self.ctx.stream_id, "Patrol resumed");
                true
            }
            _ = time::sleep(self.config.max_pause()) => {
                warn!(stream_id = %self.ctx.stream_id, "Target held past the patrol pause limit, resuming sweep");
                true
            }
        }
    }

    /// Holds the current waypoint. A newly tracked target cuts the dwell short.
    async fn dwell(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = wait_for(&mut self.engaged, true) => true,
            _ = time::sleep(self.config.dwell()) => true,
        }
    }

    fn command(&self, kind: IntentKind) {
        if let Err(e) = self.controller.move_camera(&self.ctx.camera_id, kind) {
            debug!(stream_id = %self.ctx.stream_id, error = %e, "Patrol intent not delivered");
        }
    }
}

/// Resolves once the flag equals `wanted`. Never resolves if the sender is gone.
async fn wait_for(flag: &mut watch::Receiver<bool>, wanted: bool) {
    loop {
        let current = *flag.borrow_and_update();
        if current == wanted {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(period) => true,
    }
}
