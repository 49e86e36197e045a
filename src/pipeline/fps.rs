use std::time::Instant;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Frame rate over a sliding window of the most recent frames
pub struct FpsMeter {
    window: HeapRb<Instant>,
}

impl FpsMeter {
    pub const DEFAULT_WINDOW: usize = 25;

    pub fn new(window: usize) -> Self {
        Self {
            window: HeapRb::new(window.max(2)),
        }
    }

    /// Record a frame at `now`; returns the rate once two frames are known
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        self.window.push_overwrite(now);
        self.rate()
    }

    pub fn rate(&self) -> Option<f64> {
        let count = self.window.occupied_len();
        let oldest = *self.window.iter().next()?;
        let newest = *self.window.iter().last()?;
        let span = newest.duration_since(oldest).as_secs_f64();
        if count < 2 || span <= 0.0 {
            return None;
        }
        Some((count - 1) as f64 / span)
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
