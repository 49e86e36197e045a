//! Latest-frame slot shared between the capture task and HTTP pollers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// Holds at most one frame, replaced with a single pointer swap
///
/// Readers get an `Arc` to a complete frame or nothing; a frame is never
/// mutated after publication, so no reader can observe a torn write.
pub struct FrameBuffer {
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicUsize,
    frames_read: AtomicUsize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the current frame
    pub fn publish(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: the most recent frame, possibly one already seen
    pub fn latest(&self) -> Option<Arc<Frame>> {
        let frame = self.slot.load_full();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Sequence number of the buffered frame
    pub fn frame_no(&self) -> Option<u64> {
        self.slot.load().as_ref().map(|f| f.frame_no())
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }

    /// (published, read)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.frames_published.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
        )
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameFormat;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    // Length and fill byte both derive from the frame number
    fn frame(n: u64) -> Frame {
        let len = (n % 97) as usize + 1;
        Frame::new(n, FrameFormat::Jpeg, Bytes::from(vec![n as u8; len]))
    }

    #[test]
    fn test_publish_replaces_frame() {
        let buffer = FrameBuffer::new();
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.frame_no(), None);

        buffer.publish(frame(0));
        buffer.publish(frame(1));
        let latest = buffer.latest().unwrap();
        assert_eq!(latest.frame_no(), 1);
        assert_eq!(buffer.latest().unwrap().frame_no(), 1);
        assert_eq!(buffer.stats(), (2, 2));

        buffer.clear();
        assert!(buffer.latest().is_none());
        // Readers keep their frame after it is superseded
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_frames() {
        let buffer = Arc::new(FrameBuffer::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut last = None;
                    let mut seen = 0usize;
                    while !done.load(Ordering::Acquire) {
                        if let Some(f) = buffer.latest() {
                            let n = f.frame_no();
                            assert_eq!(f.len(), (n % 97) as usize + 1);
                            assert!(f.data.iter().all(|&b| b == n as u8));
                            if let Some(prev) = last {
                                assert!(n >= prev, "frame_no went back from {prev} to {n}");
                            }
                            last = Some(n);
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        for n in 0..1000 {
            buffer.publish(frame(n));
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.frame_no(), Some(999));
    }
}
