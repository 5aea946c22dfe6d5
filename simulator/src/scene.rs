use async_trait::async_trait;
use camwatch_common::{BBox, Detection};
use camwatch_orchestrator::camera::{CameraConnector, CameraLink, PtzDevice, RawFrame};
use camwatch_orchestrator::config::{PtzProtocol, StreamConfig};
use camwatch_orchestrator::{OrchestratorError, PtzPosition, Result};
use chrono::{DateTime, Utc};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::ptz::SimulatedHead;

/// Extent of the world in view units; a camera at zoom 0 sees a 1x1 window.
const WORLD_HALF_EXTENT: f32 = 1.5;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Target {
    pub id: String,
    pub class_label: String,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub size: f32,
}

/// Payload of a simulated frame: the ground truth the detector will "see".
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SceneFrame {
    pub camera_id: String,
    pub captured_at: DateTime<Utc>,
    pub objects: Vec<Detection>,
}

#[derive(Debug, Clone)]
pub struct CameraProfile {
    pub camera_id: String,
    pub source_uri: String,
    pub fps: u32,
    pub targets: usize,
    /// Per-frame probability that the camera drops off the network.
    pub outage_rate: f64,
    /// Per-frame probability that the feed freezes without disconnecting.
    pub freeze_rate: f64,
}

#[derive(Clone, Copy)]
enum Fault {
    None,
    Offline { until: Instant },
    Frozen { until: Instant },
}

/// One simulated camera: a field of wandering targets and a PTZ head looking
/// at part of it.
pub struct CameraSim {
    profile: CameraProfile,
    targets: Vec<Target>,
    head: PtzPosition,
    fault: Fault,
    rng: StdRng,
    last_step: Instant,
}

impl CameraSim {
    pub fn new(profile: CameraProfile) -> Self {
        let mut rng = StdRng::from_entropy();
        let targets = (0..profile.targets)
            .map(|i| Target {
                id: format!("{}-T{:02}", profile.camera_id, i + 1),
                class_label: ["person", "person", "car", "dog"]
                    .choose(&mut rng)
                    .map(|label| label.to_string())
                    .unwrap_or_else(|| "person".to_string()),
                x: rng.gen_range(-1.0..1.0),
                y: rng.gen_range(-0.8..0.8),
                vx: rng.gen_range(-0.15..0.15),
                vy: rng.gen_range(-0.1..0.1),
                size: rng.gen_range(0.08..0.2),
            })
            .collect();

        Self {
            profile,
            targets,
            head: PtzPosition::default(),
            fault: Fault::None,
            rng,
            last_step: Instant::now(),
        }
    }

    pub fn head(&self) -> PtzPosition {
        self.head
    }

    pub fn set_head(&mut self, position: PtzPosition) {
        self.head = PtzPosition {
            pan: position.pan.clamp(-1.0, 1.0),
            tilt: position.tilt.clamp(-1.0, 1.0),
            zoom: position.zoom.clamp(0.0, 1.0),
        };
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.fault, Fault::Offline { until } if Instant::now() < until)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1_000 / u64::from(self.profile.fps.max(1)))
    }

    /// Moves targets and rolls for new faults.
    fn step(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f32();
        self.last_step = now;

        for target in &mut self.targets {
            target.x += target.vx * dt;
            target.y += target.vy * dt;
            if target.x.abs() > WORLD_HALF_EXTENT {
                target.vx = -target.vx;
                target.x = target.x.clamp(-WORLD_HALF_EXTENT, WORLD_HALF_EXTENT);
            }
            if target.y.abs() > WORLD_HALF_EXTENT {
                target.vy = -target.vy;
                target.y = target.y.clamp(-WORLD_HALF_EXTENT, WORLD_HALF_EXTENT);
            }
            if self.rng.gen_bool(0.02) {
                target.vx = (target.vx + self.rng.gen_range(-0.05..0.05)).clamp(-0.3, 0.3);
                target.vy = (target.vy + self.rng.gen_range(-0.05..0.05)).clamp(-0.2, 0.2);
            }
        }

        match self.fault {
            Fault::Offline { until } | Fault::Frozen { until } if now >= until => {
                info!(camera_id = %self.profile.camera_id, "Simulated fault cleared");
                self.fault = Fault::None;
            }
            Fault::None if self.rng.gen_bool(self.profile.outage_rate) => {
                let length = Duration::from_millis(self.rng.gen_range(1_000..=4_000));
                info!(camera_id = %self.profile.camera_id, ?length, "Simulated outage");
                self.fault = Fault::Offline { until: now + length };
            }
            Fault::None if self.rng.gen_bool(self.profile.freeze_rate) => {
                let length = Duration::from_millis(self.rng.gen_range(3_000..=6_000));
                info!(camera_id = %self.profile.camera_id, ?length, "Simulated frozen feed");
                self.fault = Fault::Frozen { until: now + length };
            }
            _ => {}
        }
    }

    /// Projects the targets into the current view. Boxes are clipped to the
    /// frame; targets fully outside are not visible.
    fn render(&self) -> SceneFrame {
        let half = 0.5 / (1.0 + 3.0 * self.head.zoom);
        let (cx, cy) = (self.head.pan, -self.head.tilt);

        let objects = self
            .targets
            .iter()
            .filter_map(|target| {
                let project_x = |x: f32| (x - (cx - half)) / (2.0 * half);
                let project_y = |y: f32| (y - (cy - half)) / (2.0 * half);
                let r = target.size / 2.0;
                let bbox = BBox::new(
                    project_x(target.x - r).max(0.0),
                    project_y(target.y - r).max(0.0),
                    project_x(target.x + r).min(1.0),
                    project_y(target.y + r).min(1.0),
                );
                bbox.is_normalized().then(|| Detection {
                    class_label: target.class_label.clone(),
                    confidence: 0.95,
                    bbox,
                    frame_seq: 0,
                })
            })
            .collect();

        SceneFrame {
            camera_id: self.profile.camera_id.clone(),
            captured_at: Utc::now(),
            objects,
        }
    }
}

pub type SharedCamera = Arc<Mutex<CameraSim>>;

fn lock(camera: &SharedCamera) -> Result<std::sync::MutexGuard<'_, CameraSim>> {
    camera
        .lock()
        .map_err(|_| OrchestratorError::IoError("camera state poisoned".to_string()))
}

/// Connector resolving `sim://` URIs to cameras of the scene.
pub struct SimConnector {
    cameras: HashMap<String, SharedCamera>,
}

impl SimConnector {
    pub fn new(profiles: Vec<CameraProfile>) -> Self {
        let cameras = profiles
            .into_iter()
            .map(|profile| (profile.source_uri.clone(), Arc::new(Mutex::new(CameraSim::new(profile)))))
            .collect();
        Self { cameras }
    }

    fn camera(&self, source_uri: &str) -> Result<SharedCamera> {
        self.cameras
            .get(source_uri)
            .cloned()
            .ok_or_else(|| OrchestratorError::ConnectError(format!("no camera answers at {}", source_uri)))
    }
}

#[async_trait]
impl CameraConnector for SimConnector {
    async fn open(&self, source_uri: &str) -> Result<Box<dyn CameraLink>> {
        let camera = self.camera(source_uri)?;
        sleep(Duration::from_millis(50)).await;
        if lock(&camera)?.is_offline() {
            return Err(OrchestratorError::ConnectError(format!("{} is offline", source_uri)));
        }
        debug!(source_uri, "Simulated link opened");
        Ok(Box::new(SimLink { camera }))
    }

    async fn open_ptz(&self, config: &StreamConfig) -> Result<Option<Arc<dyn PtzDevice>>> {
        if config.ptz.protocol == PtzProtocol::None {
            return Ok(None);
        }
        let camera = self.camera(&config.source_uri)?;
        Ok(Some(Arc::new(SimulatedHead::new(camera))))
    }
}

struct SimLink {
    camera: SharedCamera,
}

#[async_trait]
impl CameraLink for SimLink {
    async fn read_frame(&mut self) -> Result<RawFrame> {
        loop {
            let interval = lock(&self.camera)?.frame_interval();
            sleep(interval).await;

            let frame = {
                let mut camera = lock(&self.camera)?;
                camera.step();
                match camera.fault {
                    Fault::Offline { .. } => {
                        return Err(OrchestratorError::IoError(format!(
                            "{} stopped responding",
                            camera.profile.camera_id
                        )))
                    }
                    Fault::Frozen { .. } => None,
                    Fault::None => Some(camera.render()),
                }
            };

            let Some(frame) = frame else {
                continue;
            };
            let captured_at = frame.captured_at;
            let data = serde_json::to_vec(&frame).map_err(|e| OrchestratorError::IoError(e.to_string()))?;
            return Ok(RawFrame {
                data,
                width: 1920,
                height: 1080,
                captured_at,
            });
        }
    }

    async fn close(&mut self) {
        debug!("Simulated link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CameraProfile {
        CameraProfile {
            camera_id: "cam-test".to_string(),
            source_uri: "sim://test".to_string(),
            fps: 10,
            targets: 0,
            outage_rate: 0.0,
            freeze_rate: 0.0,
        }
    }

    fn target_at(x: f32, y: f32) -> Target {
        Target {
            id: "t".to_string(),
            class_label: "person".to_string(),
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            size: 0.1,
        }
    }

    #[test]
    fn panning_moves_target_across_the_frame() {
        let mut camera = CameraSim::new(profile());
        camera.targets.push(target_at(0.2, 0.0));

        let (cx, _) = camera.render().objects[0].bbox.center();
        assert!((cx - 0.7).abs() < 1e-4);

        camera.set_head(PtzPosition {
            pan: 0.2,
            tilt: 0.0,
            zoom: 0.0,
        });
        let (cx, cy) = camera.render().objects[0].bbox.center();
        assert!((cx - 0.5).abs() < 1e-4);
        assert!((cy - 0.5).abs() < 1e-4);
    }

    #[test]
    fn targets_outside_the_view_are_hidden() {
        let mut camera = CameraSim::new(profile());
        camera.targets.push(target_at(1.2, 0.0));
        assert!(camera.render().objects.is_empty());
    }

    #[tokio::test]
    async fn unknown_uri_is_refused() {
        let connector = SimConnector::new(vec![profile()]);
        assert!(connector.open("sim://elsewhere").await.is_err());

        let mut link = connector.open("sim://test").await.unwrap();
        let frame = link.read_frame().await.unwrap();
        let decoded: SceneFrame = serde_json::from_slice(&frame.data).unwrap();
        assert_eq!(decoded.camera_id, "cam-test");
    }
}
