//! Camera sources: a live capture process or a recorded stream file
//!
//! The variant is picked once from configuration and never switched while
//! the server runs.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::process::ChildStdout;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::capture::demux::Demuxer;
use crate::capture::error::{CaptureError, Result};
use crate::capture::frame::FrameFormat;
use crate::capture::still;
use crate::capture::supervisor::{CameraProcess, ProbeSettings, TeardownOutcome};
use crate::utils::raw_resolution;
use crate::{LiveViewConfig, SourceConfig, SourceKind};

/// Replays a recorded stream at a fixed rate
#[derive(Debug, Clone)]
pub struct RecordedStreamSource {
    pub path: PathBuf,
    pub format: FrameFormat,
    /// Frames per second, 0 for unpaced
    pub fps: f64,
    pub chunk_size: usize,
}

/// Spawns and supervises a real capture process
#[derive(Debug, Clone)]
pub struct LiveProcessSource {
    pub command: Vec<String>,
    pub unlock_command: Vec<String>,
    pub format: FrameFormat,
    pub probe: ProbeSettings,
    pub chunk_size: usize,
    pub terminate_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum CameraSource {
    Recorded(RecordedStreamSource),
    LiveProcess(LiveProcessSource),
}

impl CameraSource {
    pub fn from_config(source: &SourceConfig, liveview: &LiveViewConfig) -> Result<Self> {
        // Raw sensor output is padded by the camera firmware
        let format = match source.format {
            FrameFormat::RawLuma { width, height } => {
                let (width, height) = raw_resolution(width, height).ok_or_else(|| {
                    CaptureError::InvalidConfig(format!(
                        "raw resolution {}x{} is too large",
                        width, height
                    ))
                })?;
                FrameFormat::RawLuma { width, height }
            }
            FrameFormat::Jpeg => FrameFormat::Jpeg,
        };

        match source.kind {
            SourceKind::Recorded => {
                let path = source.path.clone().ok_or_else(|| {
                    CaptureError::InvalidConfig("recorded source needs a path".into())
                })?;
                Ok(CameraSource::Recorded(RecordedStreamSource {
                    path,
                    format,
                    fps: source.fps,
                    chunk_size: liveview.chunk_size,
                }))
            }
            SourceKind::Process => {
                if source.command.is_empty() {
                    return Err(CaptureError::EmptyCommand);
                }
                Ok(CameraSource::LiveProcess(LiveProcessSource {
                    command: source.command.clone(),
                    unlock_command: source.unlock_command.clone(),
                    format,
                    probe: ProbeSettings {
                        chunk_size: liveview.probe_chunk_size,
                        deadline: liveview.startup_deadline(),
                        not_found_patterns: source.not_found_patterns.clone(),
                    },
                    chunk_size: liveview.chunk_size,
                    terminate_timeout: liveview.terminate_timeout(),
                }))
            }
        }
    }

    pub fn format(&self) -> FrameFormat {
        match self {
            CameraSource::Recorded(s) => s.format,
            CameraSource::LiveProcess(s) => s.format,
        }
    }

    /// Bring the camera up and return a frame stream
    pub async fn open(&self) -> Result<CaptureSession> {
        match self {
            CameraSource::Recorded(src) => src.open().await,
            CameraSource::LiveProcess(src) => src.open().await,
        }
    }
}

impl RecordedStreamSource {
    pub async fn open(&self) -> Result<CaptureSession> {
        let file = File::open(&self.path).await.map_err(|e| {
            CaptureError::StartupFailure(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        info!("FAKE CAMERA from {}", self.path.display());

        let pacer = (self.fps > 0.0).then(|| {
            let mut pacer = interval(Duration::from_secs_f64(1.0 / self.fps));
            pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacer
        });
        Ok(CaptureSession {
            inner: Session::Recorded {
                demux: Demuxer::new(file, self.format, self.chunk_size),
                pacer,
            },
        })
    }
}

impl LiveProcessSource {
    pub async fn open(&self) -> Result<CaptureSession> {
        let startup = CameraProcess::start(&self.command, &self.probe, self.terminate_timeout).await;
        let startup = match startup {
            Ok(startup) => startup,
            Err(e) => {
                // The tool may have grabbed the camera before failing
                unlock(&self.unlock_command).await;
                return Err(e);
            }
        };
        Ok(CaptureSession {
            inner: Session::Process {
                demux: Demuxer::with_prefix(
                    startup.stdout,
                    &startup.prefix,
                    self.format,
                    self.chunk_size,
                ),
                process: startup.process,
                unlock_command: self.unlock_command.clone(),
            },
        })
    }
}

async fn unlock(command: &[String]) {
    if command.is_empty() {
        return;
    }
    if let Err(e) = still::unlock_camera(command).await {
        warn!("Camera unlock failed: {}", e);
    }
}

/// One open stream from a [`CameraSource`]
///
/// Must be finished with [`close`](Self::close), which tears the camera down.
pub struct CaptureSession {
    inner: Session,
}

enum Session {
    Recorded {
        demux: Demuxer<File>,
        pacer: Option<Interval>,
    },
    Process {
        demux: Demuxer<ChildStdout>,
        process: CameraProcess,
        unlock_command: Vec<String>,
    },
}

impl CaptureSession {
    /// Next frame payload, `Ok(None)` when the stream ended
    pub async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        match &mut self.inner {
            Session::Recorded { demux, pacer } => {
                let frame = demux.next_frame().await?;
                if frame.is_some() {
                    if let Some(pacer) = pacer {
                        pacer.tick().await;
                    }
                }
                Ok(frame)
            }
            Session::Process { demux, .. } => demux.next_frame().await,
        }
    }

    pub fn format(&self) -> FrameFormat {
        match &self.inner {
            Session::Recorded { demux, .. } => demux.format(),
            Session::Process { demux, .. } => demux.format(),
        }
    }

    /// Pid of the capture process, if there is one
    pub fn pid(&self) -> Option<u32> {
        match &self.inner {
            Session::Recorded { .. } => None,
            Session::Process { process, .. } => process.id(),
        }
    }

    /// Release the camera: terminate the process, then unlock the camera UI
    pub async fn close(self) {
        match self.inner {
            Session::Recorded { .. } => {}
            Session::Process {
                demux,
                process,
                unlock_command,
            } => {
                // Close our end first so a blocked writer sees EPIPE
                drop(demux);
                if let TeardownOutcome::Killed = process.terminate().await {
                    metrics::counter!("polaris_forced_kills_total").increment(1);
                }
                unlock(&unlock_command).await;
            }
        }
    }
}
