use bytes::Bytes;
use jpeg_decoder::Decoder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// One published liveview frame
///
/// Frames are immutable once built; the payload is shared, never copied,
/// between the producer and every HTTP poller holding it.
#[derive(Clone)]
pub struct Frame {
    /// Encoded payload exactly as it came off the wire
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the demuxer finished assembling the frame
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(sequence: u64, format: FrameFormat, data: Bytes) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata { sequence, format }),
            timestamp: Instant::now(),
        }
    }

    /// Sequence number since streaming began
    pub fn frame_no(&self) -> u64 {
        self.meta.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pixel dimensions; JPEG frames only have their header parsed
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.meta.format {
            FrameFormat::RawLuma { width, height } => Some((width, height)),
            FrameFormat::Jpeg => {
                let mut decoder = Decoder::new(&self.data[..]);
                decoder.read_info().ok()?;
                let info = decoder.info()?;
                Some((u32::from(info.width), u32::from(info.height)))
            }
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_no", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub format: FrameFormat,
}

/// Wire formats a camera source can produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// Back-to-back JPEG images (MJPEG)
    #[default]
    Jpeg,
    /// Luminance-only video, one byte per pixel, fixed size frames
    RawLuma { width: u32, height: u32 },
}

impl FrameFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::RawLuma { .. } => "image/yuv",
        }
    }

    /// Bytes per frame for fixed-size formats
    pub fn frame_size(&self) -> Option<usize> {
        match *self {
            FrameFormat::Jpeg => None,
            FrameFormat::RawLuma { width, height } => Some(width as usize * height as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_frame_metadata() {
        let format = FrameFormat::RawLuma { width: 32, height: 16 };
        let frame = Frame::new(7, format, Bytes::from(vec![0u8; 512]));
        assert_eq!(frame.frame_no(), 7);
        assert_eq!(frame.dimensions(), Some((32, 16)));
        assert_eq!(format.frame_size(), Some(512));
        assert_eq!(format.content_type(), "image/yuv");
    }

    #[test]
    fn test_garbage_jpeg_has_no_dimensions() {
        let frame = Frame::new(0, FrameFormat::Jpeg, Bytes::from_static(b"\xff\xd8AA\xff\xd9"));
        assert_eq!(frame.dimensions(), None);
        assert_eq!(FrameFormat::Jpeg.frame_size(), None);
    }
}
