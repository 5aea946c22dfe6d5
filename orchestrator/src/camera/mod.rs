use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{PtzProtocol, StreamConfig};
use crate::error::Result;
use crate::ptz::MovementIntent;

/// Pixel payload as delivered by a link. The worker stamps the stream-wide
/// sequence number when it turns this into a `Frame`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// One open connection to a camera's video feed.
///
/// `read_frame` must tolerate being dropped mid-await: the ingestion loop
/// abandons pending reads on stop and on staleness. Dropping the link must
/// release the underlying connection.
#[async_trait]
pub trait CameraLink: Send {
    async fn read_frame(&mut self) -> Result<RawFrame>;
    async fn close(&mut self);
}

/// Sink for PTZ commands of one physical camera. Only the PTZ controller's
/// writer task calls this, so implementations see one command at a time.
#[async_trait]
pub trait PtzDevice: Send + Sync {
    async fn send_command(&self, intent: &MovementIntent) -> Result<()>;
}

/// Opens camera links and PTZ capabilities.
#[async_trait]
pub trait CameraConnector: Send + Sync {
    async fn open(&self, source_uri: &str) -> Result<Box<dyn CameraLink>>;

    /// PTZ backend for the variant in `config.ptz.protocol`. Connectors that
    /// drive no PTZ hardware keep the default.
    async fn open_ptz(&self, config: &StreamConfig) -> Result<Option<Arc<dyn PtzDevice>>> {
        if config.ptz.protocol != PtzProtocol::None {
            tracing::warn!(
                camera_id = %config.camera_id,
                protocol = ?config.ptz.protocol,
                "Connector has no PTZ backend for requested protocol"
            );
        }
        Ok(None)
    }
}
