use std::io;

use serde::Serialize;
use thiserror::Error;

/// Failures raised while bringing up or running a camera source
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture tool reported that no camera is attached
    #[error("camera not found: {0}")]
    CameraNotFound(String),

    /// The capture process produced no stream within the probe window
    #[error("camera failed to start: {0}")]
    StartupFailure(String),

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("capture command is empty")]
    EmptyCommand,

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),

    #[error("still capture failed: {0}")]
    StillCapture(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification used by the worker and the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CameraNotFound,
    StartupFailure,
    CaptureError,
    /// The camera was still starting when the caller stopped waiting
    StartTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CameraNotFound => "camera_not_found",
            ErrorKind::StartupFailure => "startup_failure",
            ErrorKind::CaptureError => "capture_error",
            ErrorKind::StartTimeout => "start_timeout",
        }
    }
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::CameraNotFound(_) => ErrorKind::CameraNotFound,
            CaptureError::StartupFailure(_) => ErrorKind::StartupFailure,
            _ => ErrorKind::CaptureError,
        }
    }

    /// Diagnostic text without the variant prefix, as shown to the user
    pub fn detail(&self) -> String {
        match self {
            CaptureError::CameraNotFound(msg)
            | CaptureError::StartupFailure(msg)
            | CaptureError::StillCapture(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from driving a [`LiveViewWorker`](crate::pipeline::LiveViewWorker)
#[derive(Debug, Error)]
pub enum LiveViewError {
    #[error("liveview is already running")]
    AlreadyRunning,

    /// Programmer error: a frame was requested before streaming began
    #[error("liveview is not streaming")]
    NotStreaming,

    #[error("camera did not start within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl LiveViewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LiveViewError::StartTimeout(_) => ErrorKind::StartTimeout,
            LiveViewError::Capture(e) => e.kind(),
            LiveViewError::AlreadyRunning | LiveViewError::NotStreaming => ErrorKind::CaptureError,
        }
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
