//! Splits a raw camera byte stream into discrete frames
//!
//! Two framings are supported: MJPEG, where every frame is delimited by the
//! JPEG start (`FF D8`) and end (`FF D9`) markers, and raw luminance video,
//! where every frame is exactly `width * height` bytes.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::capture::frame::FrameFormat;

pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// A liveview JPEG is a few tens of KiB; one read per frame or so
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Push-based frame splitter with no I/O of its own
///
/// Malformed input never produces an error, it just never yields.
pub struct FrameScanner {
    format: FrameFormat,
    buf: BytesMut,
    // Resume point for the end-marker search, relative to `buf`
    scan_from: usize,
}

impl FrameScanner {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            buf: BytesMut::new(),
            scan_from: 0,
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes held that do not (yet) form a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Option<Bytes> {
        match self.format {
            FrameFormat::Jpeg => self.next_jpeg(),
            FrameFormat::RawLuma { .. } => {
                let size = self.format.frame_size()?;
                if size == 0 || self.buf.len() < size {
                    return None;
                }
                Some(self.buf.split_to(size).freeze())
            }
        }
    }

    fn next_jpeg(&mut self) -> Option<Bytes> {
        let Some(start) = find(&self.buf, &JPEG_START) else {
            // A trailing 0xFF may be the first half of the next start marker
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let junk = self.buf.len() - keep;
            self.buf.advance(junk);
            self.scan_from = 0;
            return None;
        };
        if start > 0 {
            self.buf.advance(start);
            self.scan_from = 0;
        }

        let from = self.scan_from.max(JPEG_START.len());
        match find(&self.buf[from..], &JPEG_END) {
            Some(offset) => {
                let end = from + offset + JPEG_END.len();
                self.scan_from = 0;
                Some(self.buf.split_to(end).freeze())
            }
            None => {
                self.scan_from = self.buf.len().saturating_sub(1).max(JPEG_START.len());
                None
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Lazy frame sequence over an async byte source
///
/// Not restartable: once the reader hits end of stream, build a new demuxer
/// for the next stream.
pub struct Demuxer<R> {
    reader: R,
    scanner: FrameScanner,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Demuxer<R> {
    pub fn new(reader: R, format: FrameFormat, chunk_size: usize) -> Self {
        Self::with_prefix(reader, &[], format, chunk_size)
    }

    /// `prefix` holds bytes already consumed from `reader` (e.g. by a startup
    /// probe); they are scanned before anything else is read.
    pub fn with_prefix(reader: R, prefix: &[u8], format: FrameFormat, chunk_size: usize) -> Self {
        let mut scanner = FrameScanner::new(format);
        scanner.push(prefix);
        Self {
            reader,
            scanner,
            chunk: vec![0; chunk_size.max(1)],
            eof: false,
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.scanner.format()
    }

    /// Next complete frame, `Ok(None)` once the upstream stream has closed.
    ///
    /// Bytes of an unfinished trailing frame are discarded at end of stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.scanner.next_frame() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                tracing::debug!(
                    buffered = self.scanner.buffered(),
                    "demuxer reached end of stream"
                );
                self.eof = true;
                continue;
            }
            self.scanner.push(&self.chunk[..n]);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_START.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_END);
        v
    }

    fn sample_frames() -> Vec<Vec<u8>> {
        vec![
            jpeg(b"AA"),
            jpeg(&[]),
            jpeg(&[0x00, 0xFF, 0x00, 0xD8, 0x42]),
            jpeg(&(0..=200u8).collect::<Vec<_>>()),
            jpeg(b"BB"),
        ]
    }

    fn scan_in_chunks(format: FrameFormat, stream: &[u8], chunk: usize) -> Vec<Bytes> {
        let mut scanner = FrameScanner::new(format);
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            scanner.push(piece);
            while let Some(frame) = scanner.next_frame() {
                out.push(frame);
            }
        }
        out
    }

    #[test]
    fn test_jpeg_frames_survive_any_chunking() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.concat();

        for chunk in 1..=stream.len() {
            let got = scan_in_chunks(FrameFormat::Jpeg, &stream, chunk);
            assert_eq!(got.len(), frames.len(), "chunk size {chunk}");
            for (g, want) in got.iter().zip(&frames) {
                assert_eq!(&g[..], &want[..], "chunk size {chunk}");
            }
        }
    }

    #[test]
    fn test_jpeg_split_at_every_offset() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.concat();

        for split in 0..=stream.len() {
            let mut scanner = FrameScanner::new(FrameFormat::Jpeg);
            let mut got = Vec::new();
            for piece in [&stream[..split], &stream[split..]] {
                scanner.push(piece);
                while let Some(frame) = scanner.next_frame() {
                    got.push(frame.to_vec());
                }
            }
            assert_eq!(got, frames, "split at {split}");
        }
    }

    #[test]
    fn test_jpeg_skips_garbage_between_frames() {
        let mut stream = b"gphoto2 banner".to_vec();
        stream.extend(jpeg(b"AA"));
        stream.extend_from_slice(&[0x01, 0xFF, 0x02]);
        stream.extend(jpeg(b"BB"));

        let got = scan_in_chunks(FrameFormat::Jpeg, &stream, 3);
        assert_eq!(got, vec![jpeg(b"AA"), jpeg(b"BB")]);
    }

    #[test]
    fn test_jpeg_without_end_marker_never_yields() {
        let mut scanner = FrameScanner::new(FrameFormat::Jpeg);
        scanner.push(&JPEG_START);
        scanner.push(&[0x11; 64]);
        assert!(scanner.next_frame().is_none());

        // Garbage without any start marker is not retained
        let mut scanner = FrameScanner::new(FrameFormat::Jpeg);
        scanner.push(&[0x11; 4096]);
        assert!(scanner.next_frame().is_none());
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_raw_luma_fixed_size_frames() {
        let format = FrameFormat::RawLuma { width: 4, height: 3 };
        let frames: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 12]).collect();
        let stream = frames.concat();

        for chunk in [1, 5, 7, 12, 13, 31, stream.len()] {
            let got = scan_in_chunks(format, &stream, chunk);
            assert_eq!(got.len(), 5, "chunk size {chunk}");
            for (g, want) in got.iter().zip(&frames) {
                assert_eq!(g.len(), 12);
                assert_eq!(&g[..], &want[..]);
            }
        }
    }

    #[test]
    fn test_raw_luma_keeps_remainder() {
        let mut scanner = FrameScanner::new(FrameFormat::RawLuma { width: 2, height: 2 });
        scanner.push(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(scanner.next_frame().as_deref(), Some(&[1, 2, 3, 4][..]));
        assert!(scanner.next_frame().is_none());
        assert_eq!(scanner.buffered(), 2);
    }

    #[tokio::test]
    async fn test_demuxer_uses_prefix_then_reader() {
        let stream: Vec<u8> = sample_frames().concat();
        let (prefix, rest) = stream.split_at(7);

        let mut demux =
            Demuxer::with_prefix(Cursor::new(rest.to_vec()), prefix, FrameFormat::Jpeg, 5);
        let mut got = Vec::new();
        while let Some(frame) = demux.next_frame().await.unwrap() {
            got.push(frame.to_vec());
        }
        assert_eq!(got, sample_frames());
    }

    #[tokio::test]
    async fn test_demuxer_ends_on_eof_dropping_partial_frame() {
        let mut stream = jpeg(b"AA");
        stream.extend_from_slice(&JPEG_START);
        stream.extend_from_slice(b"truncated");

        let mut demux = Demuxer::new(Cursor::new(stream), FrameFormat::Jpeg, DEFAULT_CHUNK_SIZE);
        assert_eq!(demux.next_frame().await.unwrap().unwrap(), jpeg(b"AA"));
        assert!(demux.next_frame().await.unwrap().is_none());
        // Stays exhausted
        assert!(demux.next_frame().await.unwrap().is_none());
    }
}
