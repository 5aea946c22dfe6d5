//! PTZ intent and position types.

use serde::{Deserialize, Serialize};

/// Absolute pan/tilt/zoom setpoint in the device's normalized space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PtzPosition {
    pub pan: f32,
    pub tilt: f32,
    pub zoom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum IntentKind {
    /// Continuous velocity, each axis in [-1.0, 1.0].
    Relative { pan: f32, tilt: f32, zoom: f32 },
    Absolute(PtzPosition),
    Stop,
}

impl IntentKind {
    pub fn relative(pan: f32, tilt: f32, zoom: f32) -> Self {
        Self::Relative {
            pan: pan.clamp(-1.0, 1.0),
            tilt: tilt.clamp(-1.0, 1.0),
            zoom: zoom.clamp(-1.0, 1.0),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::Relative { pan, tilt, zoom } => *pan == 0.0 && *tilt == 0.0 && *zoom == 0.0,
            Self::Absolute(_) | Self::Stop => false,
        }
    }
}

/// A movement request stamped by the controller. Sequences increase per camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementIntent {
    pub camera_id: String,
    pub kind: IntentKind,
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_clamps_axes() {
        let intent = IntentKind::relative(2.0, -3.0, 0.25);
        assert_eq!(
            intent,
            IntentKind::Relative {
                pan: 1.0,
                tilt: -1.0,
                zoom: 0.25
            }
        );
    }

    #[test]
    fn zero_detection() {
        assert!(IntentKind::relative(0.0, 0.0, 0.0).is_zero());
        assert!(!IntentKind::Stop.is_zero());
        assert!(!IntentKind::Absolute(PtzPosition::default()).is_zero());
    }
}
