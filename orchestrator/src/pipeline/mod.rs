use camwatch_common::{Detection, EventType, Frame};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::inference::{normalize_detections, Detector};
use crate::processing::EventProcessor;
use crate::stream::StreamContext;

mod queue;

pub use queue::FrameQueue;

/// Detector output for one frame, ordered by descending confidence.
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    pub frame_seq: u64,
    pub captured_at: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Per-stream ingestion -> detection -> event processing chain.
///
/// The only lossy point is the frame queue; the detection -> processor
/// channel is bounded and applies backpressure to the detection stage, which
/// in turn lets the frame queue overflow.
pub struct DetectionPipeline {
    ctx: StreamContext,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
    stages: Vec<JoinHandle<()>>,
}

impl DetectionPipeline {
    pub fn start(
        ctx: StreamContext,
        detector: Arc<dyn Detector>,
        processor: EventProcessor,
        config: &PipelineConfig,
        detection_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let queue = Arc::new(FrameQueue::new(config.frame_queue_capacity));
        let cancel = parent.child_token();
        let (batch_tx, batch_rx) = mpsc::channel(config.event_queue_capacity.max(1));

        let detection = tokio::spawn(detection_stage(
            ctx.clone(),
            detector,
            queue.clone(),
            batch_tx,
            detection_interval,
            cancel.clone(),
        ));
        let processing = tokio::spawn(processor.run(batch_rx, cancel.clone()));

        info!(
            stream_id = %ctx.stream_id,
            capacity = queue.capacity(),
            "Detection pipeline started"
        );

        Self {
            ctx,
            queue,
            cancel,
            stages: vec![detection, processing],
        }
    }

    /// Hands a frame to the detection stage, evicting the oldest queued frame
    /// when full.
    pub fn submit(&self, frame: Frame) {
        if let Some(dropped) = self.queue.push(frame) {
            self.ctx.metrics.record_frame_dropped(&self.ctx.stream_id);
            self.ctx.status.send_modify(|s| s.frames_dropped += 1);
            self.ctx.emit(
                EventType::FrameDropped,
                json!({
                    "frame_seq": dropped.sequence,
                    "queue_capacity": self.queue.capacity(),
                }),
            );
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stops both stages and discards queued frames without detecting them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.queue.close();
        let discarded = self.queue.clear();

        for stage in self.stages {
            if let Err(e) = stage.await {
                warn!(stream_id = %self.ctx.stream_id, error = %e, "Pipeline stage ended abnormally");
            }
        }
        debug!(stream_id = %self.ctx.stream_id, discarded, "Detection pipeline drained");
    }
}

async fn detection_stage(
    ctx: StreamContext,
    detector: Arc<dyn Detector>,
    queue: Arc<FrameQueue>,
    batches: mpsc::Sender<DetectionBatch>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut last_detected: Option<DateTime<Utc>> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = queue.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Some(last) = last_detected {
            let elapsed = (frame.captured_at - last).to_std().unwrap_or_default();
            if !interval.is_zero() && elapsed < interval {
                continue;
            }
        }

        let job = {
            let detector = detector.clone();
            let frame = frame.clone();
            tokio::task::spawn_blocking(move || detector.detect(&frame))
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = job => outcome,
        };

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                report_detection_error(&ctx, frame.sequence, e.to_string());
                continue;
            }
            Err(e) => {
                report_detection_error(&ctx, frame.sequence, format!("detector panicked: {}", e));
                continue;
            }
        };

        last_detected = Some(frame.captured_at);
        let batch = DetectionBatch {
            frame_seq: frame.sequence,
            captured_at: frame.captured_at,
            detections: normalize_detections(&frame, raw),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = batches.send(batch) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!(stream_id = %ctx.stream_id, "Detection stage stopped");
}

fn report_detection_error(ctx: &StreamContext, frame_seq: u64, error: String) {
    warn!(stream_id = %ctx.stream_id, frame_seq, error = %error, "Detection failed, frame discarded");
    ctx.metrics.record_detection_error(&ctx.stream_id);
    ctx.status.send_modify(|s| s.detection_errors += 1);
    ctx.emit(
        EventType::DetectionError,
        json!({ "frame_seq": frame_seq, "error": error }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::error::{OrchestratorError, Result};
    use crate::testing::{test_context, wait_until, RecordingSink};
    use camwatch_common::BBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyDetector {
        calls: AtomicUsize,
    }

    impl Detector for FlakyDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match frame.sequence {
                2 => Err(OrchestratorError::DetectionError("malformed frame".to_string())),
                4 => panic!("model crashed"),
                _ => Ok(vec![person(0.9)]),
            }
        }
    }

    struct SlowDetector;

    impl Detector for SlowDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            std::thread::sleep(Duration::from_millis(50));
            Ok(vec![person(0.8)])
        }
    }

    fn person(confidence: f32) -> Detection {
        Detection {
            class_label: "person".to_string(),
            confidence,
            bbox: BBox::new(0.4, 0.4, 0.6, 0.6),
            frame_seq: 0,
        }
    }

    fn processor(ctx: &StreamContext) -> EventProcessor {
        EventProcessor::new(ctx.clone(), &StreamConfig::new("cam-1", "sim://lobby"), None)
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 8], 4, 2, Utc::now(), seq)
    }

    #[tokio::test]
    async fn bad_frames_do_not_halt_the_stream() {
        let sink = Arc::new(RecordingSink::default());
        let (ctx, _status) = test_context("s1", sink.clone());
        let detector = Arc::new(FlakyDetector {
            calls: AtomicUsize::new(0),
        });
        let root = CancellationToken::new();

        let pipeline = DetectionPipeline::start(
            ctx.clone(),
            detector.clone(),
            processor(&ctx),
            &PipelineConfig::default(),
            Duration::ZERO,
            &root,
        );

        for seq in 1..=5 {
            pipeline.submit(frame(seq));
        }

        assert!(wait_until(Duration::from_secs(2), || sink.count(EventType::Detection) == 3).await);
        assert_eq!(sink.count(EventType::DetectionError), 2);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 5);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn overrun_drops_frames_and_stays_bounded() {
        let sink = Arc::new(RecordingSink::default());
        let (ctx, status) = test_context("s1", sink.clone());
        let config = PipelineConfig {
            frame_queue_capacity: 4,
            ..PipelineConfig::default()
        };
        let root = CancellationToken::new();
        let pipeline = DetectionPipeline::start(
            ctx.clone(),
            Arc::new(SlowDetector),
            processor(&ctx),
            &config,
            Duration::ZERO,
            &root,
        );

        for seq in 0..200 {
            pipeline.submit(frame(seq));
            assert!(pipeline.queued() <= 4);
        }

        let dropped = status.borrow().frames_dropped;
        assert!(dropped >= 195, "dropped {}", dropped);
        assert!(wait_until(Duration::from_secs(1), || sink.count(EventType::FrameDropped) as u64 == dropped).await);
        assert_eq!(ctx.metrics.frames_dropped("s1"), dropped);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_backlog() {
        let sink = Arc::new(RecordingSink::default());
        let (ctx, _status) = test_context("s1", sink.clone());
        let root = CancellationToken::new();
        let pipeline = DetectionPipeline::start(
            ctx.clone(),
            Arc::new(SlowDetector),
            processor(&ctx),
            &PipelineConfig::default(),
            Duration::ZERO,
            &root,
        );

        for seq in 0..10 {
            pipeline.submit(frame(seq));
        }
        tokio::time::timeout(Duration::from_secs(1), pipeline.shutdown())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count(EventType::Detection), 0);
    }
}
