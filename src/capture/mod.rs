pub mod demux;
pub mod error;
pub mod frame;
pub mod source;
pub mod still;
pub mod supervisor;

pub use demux::{Demuxer, FrameScanner};
pub use error::{CaptureError, ErrorKind, LiveViewError};
pub use frame::{Frame, FrameFormat};
pub use source::{CameraSource, CaptureSession, LiveProcessSource, RecordedStreamSource};
pub use supervisor::CameraProcess;
