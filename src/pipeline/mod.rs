pub mod fps;
pub mod frame_buffer;
pub mod worker;

pub use fps::FpsMeter;
pub use frame_buffer::FrameBuffer;
pub use worker::{LiveViewWorker, WorkerEvent, WorkerSettings, WorkerState, WorkerStatus};
