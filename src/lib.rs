pub mod capture;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::FrameFormat;
use serde::{Deserialize, Serialize};

/// System configuration
///
/// Each component receives the section it needs at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub liveview: LiveViewConfig,
    pub source: SourceConfig,
    pub still: StillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveViewConfig {
    /// Stop streaming when nobody polled for this long
    pub idle_timeout_secs: f64,
    /// Bound on the startup probe reads
    pub startup_deadline_secs: f64,
    /// Give up on a stream that delivers no frame for this long; must exceed
    /// the frame interval of the slowest source
    pub stall_timeout_secs: f64,
    pub chunk_size: usize,
    pub probe_chunk_size: usize,
    /// How long an HTTP poller waits for the worker to leave STARTING
    pub start_wait_secs: f64,
    pub start_poll_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub terminate_timeout_ms: u64,
    /// Drop frames arriving faster than this
    pub max_fps: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Spawn and supervise an external capture command
    Process,
    /// Replay a recorded stream file
    Recorded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub format: FrameFormat,
    pub command: Vec<String>,
    /// Run after every capture process teardown to release the camera UI
    pub unlock_command: Vec<String>,
    /// Case-insensitive stderr fragments meaning "no camera attached"
    pub not_found_patterns: Vec<String>,
    pub path: Option<PathBuf>,
    /// Replay rate for recorded streams, 0 for as fast as possible
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StillConfig {
    pub cache_dir: PathBuf,
    /// `{filename}` and `{output}` are substituted before running
    pub get_file_command: Vec<String>,
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
        }
    }
}

impl Default for LiveViewConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 10.0,
            startup_deadline_secs: 5.0,
            stall_timeout_secs: 5.0,
            chunk_size: capture::demux::DEFAULT_CHUNK_SIZE,
            probe_chunk_size: 1024,
            start_wait_secs: 5.0,
            start_poll_ms: 100,
            terminate_timeout_ms: 1000,
            max_fps: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Process,
            format: FrameFormat::Jpeg,
            command: args(&[
                "gphoto2",
                "--set-config",
                "output=TFT + PC",
                "--capture-movie",
                "--stdout",
            ]),
            unlock_command: args(&["gphoto2", "--set-config", "output=TFT"]),
            not_found_patterns: args(&["No camera found", "Could not detect any camera"]),
            path: None,
            fps: 5.0,
        }
    }
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("polaris-cache"),
            get_file_command: args(&[
                "gphoto2",
                "--get-file",
                "{filename}",
                "--filename",
                "{output}",
            ]),
        }
    }
}

impl LiveViewConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_secs.max(0.0))
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.startup_deadline_secs.max(0.0))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stall_timeout_secs.max(0.0))
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_secs_f64(self.start_wait_secs.max(0.0))
    }

    pub fn start_poll(&self) -> Duration {
        Duration::from_millis(self.start_poll_ms.max(1))
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `POLARIS__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("POLARIS").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Switch to replaying `path` instead of driving a real camera
    pub fn use_recording(&mut self, path: PathBuf) {
        self.source.kind = SourceKind::Recorded;
        self.source.path = Some(path);
    }
}
