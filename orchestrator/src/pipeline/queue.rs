use camwatch_common::Frame;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Fixed-capacity frame queue between ingestion and detection.
///
/// Pushing never blocks: a full queue evicts its oldest frame. Live video
/// favours the freshest frame over a complete backlog.
pub struct FrameQueue {
    frames: ArrayQueue<Frame>,
    ready: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues `frame` and returns the frame evicted to make room, if any.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let evicted = self.frames.force_push(frame);
        self.ready.notify_one();
        evicted
    }

    /// Next frame in capture order, or `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.frames.pop() {
                return Some(frame);
            }
            self.ready.notified().await;
        }
    }

    /// Wakes the consumer and makes every later `pop` return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// Discards queued frames; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        while self.frames.pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 16], 4, 4, Utc::now(), seq)
    }

    #[test]
    fn overrun_evicts_oldest_and_stays_bounded() {
        let queue = FrameQueue::new(4);
        let mut evicted = Vec::new();
        for seq in 0..100 {
            if let Some(old) = queue.push(frame(seq)) {
                evicted.push(old.sequence);
            }
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(evicted.len(), 96);
        assert_eq!(evicted[..3], [0, 1, 2]);
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn pops_in_capture_order() {
        let queue = FrameQueue::new(8);
        for seq in 10..14 {
            queue.push(frame(seq));
        }
        for seq in 10..14 {
            assert_eq!(queue.pop().await.map(|f| f.sequence), Some(seq));
        }
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push(frame(1)).is_none());
        assert_eq!(queue.push(frame(2)).map(|f| f.sequence), Some(1));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }
}
