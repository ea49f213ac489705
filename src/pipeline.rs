//! Bounded frame/audio channels and the detection throttle
//!
//! Capture runs faster than perception. Every hand-off between workers goes
//! through a [`BoundedChannel`] with a fixed capacity:
//!
//! - `push` never blocks; when full the oldest item is evicted
//! - `pop_latest` takes the newest item and discards everything older in the
//!   same locked step, so detection only ever sees the freshest frame
//!
//! Consumers that find a channel empty sleep a short fixed backoff and retry.

use crate::config::PipelineConfig;
use crate::frame::{AudioChunk, DetectionInput, Frame};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Fixed-capacity queue with drop-oldest push and take-newest pop
#[derive(Debug)]
pub struct BoundedChannel<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking producer must not take the pipeline down with it
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an item, evicting the oldest if the channel is full.
    ///
    /// Returns true if an item was evicted.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.lock();
        let evicted = if items.len() >= self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        evicted
    }

    /// Take the newest item and drop everything older
    pub fn pop_latest(&self) -> Option<T> {
        let mut items = self.lock();
        let latest = items.pop_back();
        items.clear();
        latest
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedChannel<T> {
    /// Clone of the newest item without consuming it
    pub fn peek_latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

/// The channels shared between capture, detection and preview workers
#[derive(Debug, Clone)]
pub struct FrameChannels {
    /// Raw frames from the video capture worker
    pub capture: Arc<BoundedChannel<Frame>>,
    /// Cropped, resized frames as handed to perception
    pub cropped: Arc<BoundedChannel<DetectionInput>>,
    /// Annotated frames for the live preview and sleep snapshots
    pub debug: Arc<BoundedChannel<RgbImage>>,
    /// PCM chunks from the audio capture worker
    pub audio: Arc<BoundedChannel<AudioChunk>>,
}

impl FrameChannels {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            capture: Arc::new(BoundedChannel::new(config.capture_capacity)),
            cropped: Arc::new(BoundedChannel::new(config.cropped_capacity)),
            debug: Arc::new(BoundedChannel::new(config.debug_capacity)),
            audio: Arc::new(BoundedChannel::new(config.audio_capacity)),
        }
    }
}

/// Bounds a worker loop to a minimum interval between cycles
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_cycle: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_cycle: None,
        }
    }

    /// Time left before the next cycle may start
    pub fn remaining(&self) -> Duration {
        match self.last_cycle {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Sleep out the remainder of the interval (blocking)
    pub fn wait(&self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
    }

    /// Mark the end of a cycle
    pub fn mark(&mut self) {
        self.last_cycle = Some(Instant::now());
    }
}

/// Pop the newest item, sleeping `backoff` between attempts while empty.
///
/// Blocks the calling thread; used by the std-thread workers.
pub fn pop_latest_blocking<T>(channel: &BoundedChannel<T>, backoff: Duration) -> T {
    loop {
        if let Some(item) = channel.pop_latest() {
            return item;
        }
        std::thread::sleep(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let ch = BoundedChannel::new(3);
        assert!(!ch.push(1));
        assert!(!ch.push(2));
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.capacity(), 3);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let ch = BoundedChannel::new(3);
        for i in 0..3 {
            ch.push(i);
        }
        assert!(ch.push(3));
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.peek_latest(), Some(3));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let ch = BoundedChannel::new(20);
        for i in 0..1000 {
            ch.push(i);
            assert!(ch.len() <= 20);
        }
    }

    #[test]
    fn test_pop_latest_drains_older() {
        let ch = BoundedChannel::new(5);
        for i in 0..4 {
            ch.push(i);
        }
        assert_eq!(ch.pop_latest(), Some(3));
        assert!(ch.is_empty());
        assert_eq!(ch.pop_latest(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let ch = BoundedChannel::new(3);
        ch.push("a".to_string());
        ch.push("b".to_string());
        assert_eq!(ch.peek_latest().as_deref(), Some("b"));
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let ch = BoundedChannel::new(0);
        assert_eq!(ch.capacity(), 1);
        ch.push(1);
        assert!(ch.push(2));
        assert_eq!(ch.pop_latest(), Some(2));
    }

    #[test]
    fn test_concurrent_producers() {
        let ch = Arc::new(BoundedChannel::new(10));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ch = Arc::clone(&ch);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        ch.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ch.len(), 10);
    }

    #[test]
    fn test_pop_latest_blocking_returns_pushed_item() {
        let ch = Arc::new(BoundedChannel::new(3));
        let producer = {
            let ch = Arc::clone(&ch);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ch.push(42);
            })
        };
        let item = pop_latest_blocking(&ch, Duration::from_millis(5));
        assert_eq!(item, 42);
        producer.join().unwrap();
    }

    #[test]
    fn test_throttle_first_cycle_is_free() {
        let throttle = Throttle::new(Duration::from_secs(10));
        assert_eq!(throttle.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_throttle_waits_remainder() {
        let mut throttle = Throttle::new(Duration::from_millis(40));
        throttle.mark();
        assert!(throttle.remaining() > Duration::ZERO);
        let start = Instant::now();
        throttle.wait();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(throttle.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_frame_channels_sizes() {
        let channels = FrameChannels::new(&PipelineConfig::default());
        assert_eq!(channels.capture.capacity(), 20);
        assert_eq!(channels.cropped.capacity(), 3);
        assert_eq!(channels.debug.capacity(), 3);
        assert_eq!(channels.audio.capacity(), 10);
    }
}
