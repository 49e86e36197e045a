#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use polaris::capture::CameraSource;
use polaris::pipeline::{LiveViewWorker, WorkerSettings, WorkerState};
use polaris::{Config, LiveViewConfig, SourceConfig, SourceKind};
use tempfile::TempDir;

pub fn jpeg(body: &[u8]) -> Vec<u8> {
    let mut v = vec![0xFF, 0xD8];
    v.extend_from_slice(body);
    v.extend_from_slice(&[0xFF, 0xD9]);
    v
}

/// The three-frame AA/BB/CC stream
pub fn abc_stream() -> Vec<u8> {
    [jpeg(b"AA"), jpeg(b"BB"), jpeg(b"CC")].concat()
}

pub fn write_fixture(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

pub fn liveview_config(idle_timeout_secs: f64) -> LiveViewConfig {
    LiveViewConfig {
        idle_timeout_secs,
        startup_deadline_secs: 2.0,
        start_wait_secs: 5.0,
        start_poll_ms: 10,
        terminate_timeout_ms: 500,
        ..LiveViewConfig::default()
    }
}

pub fn recorded_source(path: &Path, fps: f64) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Recorded,
        path: Some(path.to_path_buf()),
        fps,
        unlock_command: Vec::new(),
        ..SourceConfig::default()
    }
}

pub fn process_source(command: Vec<String>) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Process,
        command,
        unlock_command: Vec::new(),
        ..SourceConfig::default()
    }
}

pub fn config(source: SourceConfig, liveview: LiveViewConfig) -> Config {
    Config {
        source,
        liveview,
        ..Config::default()
    }
}

pub fn worker(config: &Config) -> LiveViewWorker {
    let source = CameraSource::from_config(&config.source, &config.liveview).unwrap();
    LiveViewWorker::new(
        source,
        WorkerSettings::from(&config.liveview),
        tokio::runtime::Handle::current(),
    )
}

/// Poll until `state` is reached or `max` elapses
pub async fn wait_for_state(worker: &LiveViewWorker, state: WorkerState, max: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max;
    while tokio::time::Instant::now() < deadline {
        if worker.state() == state && (state == WorkerState::Streaming || !worker.is_running()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A fake camera that records its pid and streams `fixture` forever
pub fn looping_camera(dir: &TempDir, fixture: &Path) -> (Vec<String>, PathBuf) {
    let pidfile = dir.path().join("camera.pid");
    let script = write_fixture(
        dir,
        "camera.sh",
        b"echo $$ > \"$1\"\nwhile true; do cat \"$2\"; sleep 0.05; done\n",
    );
    let command = vec![
        "sh".to_string(),
        script.to_string_lossy().into_owned(),
        pidfile.to_string_lossy().into_owned(),
        fixture.to_string_lossy().into_owned(),
    ];
    (command, pidfile)
}

pub fn process_is_gone(pidfile: &Path) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid: i32 = std::fs::read_to_string(pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH)
}

/// A fake camera that writes one frame, then hangs with stdout still open
pub fn stalled_camera(dir: &TempDir) -> (Vec<String>, PathBuf) {
    let pidfile = dir.path().join("stalled.pid");
    let script = write_fixture(
        dir,
        "stalled.sh",
        b"echo $$ > \"$1\"\nprintf '\\377\\330AA'\nsleep 0.2\nprintf '\\377\\331'\nexec sleep 30\n",
    );
    let command = vec![
        "sh".to_string(),
        script.to_string_lossy().into_owned(),
        pidfile.to_string_lossy().into_owned(),
    ];
    (command, pidfile)
}

/// A camera that takes a second to produce its first frames
pub fn slow_camera() -> Vec<String> {
    sh(r"sleep 1; printf '\377\330AA\377\331'; sleep 0.1; printf '\377\330BB\377\331'; exec sleep 30")
}
