use async_trait::async_trait;
use camwatch_orchestrator::camera::PtzDevice;
use camwatch_orchestrator::{IntentKind, MovementIntent, OrchestratorError, PtzPosition, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::scene::SharedCamera;

/// Fraction of the view a full-speed relative command moves per step.
const STEP_SCALE: f32 = 0.25;

/// Motorized head of a simulated camera. Commands take a little while to
/// execute, like a real head.
pub struct SimulatedHead {
    camera: SharedCamera,
    latency: Duration,
}

impl SimulatedHead {
    pub fn new(camera: SharedCamera) -> Self {
        Self {
            camera,
            latency: Duration::from_millis(40),
        }
    }
}

pub fn apply(head: PtzPosition, kind: IntentKind) -> PtzPosition {
    match kind {
        IntentKind::Relative { pan, tilt, zoom } => PtzPosition {
            pan: head.pan + pan * STEP_SCALE,
            tilt: head.tilt + tilt * STEP_SCALE,
            zoom: head.zoom + zoom * STEP_SCALE,
        },
        IntentKind::Absolute(position) => position,
        IntentKind::Stop => head,
    }
}

#[async_trait]
impl PtzDevice for SimulatedHead {
    async fn send_command(&self, intent: &MovementIntent) -> Result<()> {
        sleep(self.latency).await;

        let mut camera = self
            .camera
            .lock()
            .map_err(|_| OrchestratorError::CommandError("camera state poisoned".to_string()))?;
        if camera.is_offline() {
            return Err(OrchestratorError::CommandError(format!(
                "{} head unreachable",
                intent.camera_id
            )));
        }

        let next = apply(camera.head(), intent.kind);
        camera.set_head(next);
        debug!(
            camera_id = %intent.camera_id,
            sequence = intent.sequence,
            pan = next.pan,
            tilt = next.tilt,
            zoom = next.zoom,
            "Head moved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_moves_scale_with_speed() {
        let next = apply(PtzPosition::default(), IntentKind::relative(1.0, -0.4, 0.0));
        assert!((next.pan - 0.25).abs() < 1e-6);
        assert!((next.tilt + 0.1).abs() < 1e-6);
        assert_eq!(apply(next, IntentKind::Stop), next);
    }
}
