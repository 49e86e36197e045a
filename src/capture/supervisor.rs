//! Lifecycle of the external capture process
//!
//! A capture tool such as `gphoto2 --capture-movie --stdout` writes MJPEG to
//! stdout when a camera is attached, and a few lines of text on stderr
//! followed by a non-zero exit when it is not. The startup probe tells these
//! apart before any byte reaches the demuxer.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::capture::error::{CaptureError, Result};
use crate::utils::format_command;

/// Startup probe parameters
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Size of each of the two probe reads
    pub chunk_size: usize,
    pub deadline: Duration,
    pub not_found_patterns: Vec<String>,
}

/// How a teardown ended
#[derive(Debug)]
pub enum TeardownOutcome {
    /// Exited on its own or after SIGTERM
    Exited(ExitStatus),
    /// Ignored SIGTERM for the whole grace period
    Killed,
    /// Could not be waited on
    Lost(std::io::Error),
}

/// A running capture process that passed the startup probe
pub struct Startup {
    pub process: CameraProcess,
    pub stdout: ChildStdout,
    /// Bytes consumed by the probe, to be fed to the demuxer first
    pub prefix: Vec<u8>,
}

/// Handle to one launched capture process
///
/// [`terminate`](Self::terminate) consumes the handle, so it runs at most once;
/// the child is also killed if the handle is dropped without it.
pub struct CameraProcess {
    child: Child,
    command: String,
    terminate_timeout: Duration,
}

impl CameraProcess {
    /// Spawn `command` with stdout and stderr captured
    pub fn launch(command: &[String], terminate_timeout: Duration) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(CaptureError::EmptyCommand)?;
        let cmdline = format_command(command);
        info!("Executing: {}", cmdline);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: cmdline.clone(),
                source,
            })?;

        Ok(Self {
            child,
            command: cmdline,
            terminate_timeout,
        })
    }

    /// Launch and probe: two bounded reads from stdout within the deadline.
    ///
    /// An empty second read means the tool is not streaming. The process is
    /// then reaped and its stderr becomes the error detail.
    pub async fn start(
        command: &[String],
        probe: &ProbeSettings,
        terminate_timeout: Duration,
    ) -> Result<Startup> {
        let mut process = Self::launch(command, terminate_timeout)?;
        let mut stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::StartupFailure("stdout was not captured".into()))?;

        let chunk = probe.chunk_size.max(1);
        let mut first = vec![0u8; chunk];
        let mut second = vec![0u8; chunk];
        let probed = timeout(probe.deadline, async {
            let n0 = stdout.read(&mut first).await?;
            let n1 = if n0 == 0 {
                0
            } else {
                stdout.read(&mut second).await?
            };
            Ok::<_, std::io::Error>((n0, n1))
        })
        .await;

        match probed {
            Ok(Ok((n0, n1))) if n1 > 0 => {
                debug!(bytes = n0 + n1, "startup probe read stream data");
                let mut prefix = first;
                prefix.truncate(n0);
                prefix.extend_from_slice(&second[..n1]);
                process.log_stderr();
                Ok(Startup {
                    process,
                    stdout,
                    prefix,
                })
            }
            Ok(Ok((n0, _))) => {
                let detail = process.failure_detail(&first[..n0]).await;
                Err(classify(detail, &probe.not_found_patterns))
            }
            Ok(Err(e)) => {
                process.terminate().await;
                Err(CaptureError::Io(e))
            }
            Err(_) => {
                warn!("No stream from `{}` within {:?}", process.command, probe.deadline);
                let detail = process.failure_detail(&[]).await;
                let detail = if detail.is_empty() {
                    format!("no stream within {:?}", probe.deadline)
                } else {
                    detail
                };
                Err(classify(detail, &probe.not_found_patterns))
            }
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Reap a process that failed the probe and collect what it said
    async fn failure_detail(mut self, stdout_head: &[u8]) -> String {
        let mut stderr = Vec::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            // A grandchild may hold the pipe open, so bound the drain
            let _ = timeout(self.terminate_timeout, pipe.read_to_end(&mut stderr)).await;
        }
        self.terminate().await;

        let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();
        if !stderr.is_empty() {
            return stderr;
        }
        String::from_utf8_lossy(stdout_head).trim_end().to_string()
    }

    /// Forward stderr of a healthy process to the log so the pipe never fills
    fn log_stderr(&mut self) {
        let Some(pipe) = self.child.stderr.take() else {
            return;
        };
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %command, "stderr: {}", line);
            }
        });
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL
    pub async fn terminate(mut self) -> TeardownOutcome {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("`{}` already exited: {}", self.command, status);
            return TeardownOutcome::Exited(status);
        }

        if let Some(pid) = self.child.id() {
            info!("Sending SIGTERM to `{}` (pid {})", self.command, pid);
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM to pid {} failed: {}", pid, e);
            }
        }

        match timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process successfully terminated: {}", status);
                TeardownOutcome::Exited(status)
            }
            Ok(Err(e)) => {
                warn!("Waiting for `{}` failed: {}", self.command, e);
                TeardownOutcome::Lost(e)
            }
            Err(_) => {
                warn!(
                    "`{}` ignored SIGTERM for {:?}, killing the process",
                    self.command, self.terminate_timeout
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Killing `{}` failed: {}", self.command, e);
                    return TeardownOutcome::Lost(e);
                }
                TeardownOutcome::Killed
            }
        }
    }
}

/// Map probe output to "no camera" vs. generic startup failure
pub fn classify(detail: String, not_found_patterns: &[String]) -> CaptureError {
    let lower = detail.to_lowercase();
    let not_found = not_found_patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| lower.contains(&p.to_lowercase()));
    if not_found {
        CaptureError::CameraNotFound(detail)
    } else {
        CaptureError::StartupFailure(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::error::ErrorKind;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn probe() -> ProbeSettings {
        ProbeSettings {
            chunk_size: 1024,
            deadline: Duration::from_secs(2),
            not_found_patterns: vec!["No camera found".into()],
        }
    }

    #[test]
    fn test_classify() {
        let patterns = vec!["no camera found".to_string()];
        let err = classify("*** Error: No camera found. ***".into(), &patterns);
        assert_eq!(err.kind(), ErrorKind::CameraNotFound);
        assert_eq!(err.detail(), "*** Error: No camera found. ***");

        let err = classify("permission denied".into(), &patterns);
        assert_eq!(err.kind(), ErrorKind::StartupFailure);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let err = CameraProcess::launch(&[], Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, CaptureError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cmd = vec!["/nonexistent/polaris-capture".to_string(), "--stdout".to_string()];
        let err = CameraProcess::start(&cmd, &probe(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        match err {
            CaptureError::Spawn { command, .. } => {
                assert_eq!(command, "/nonexistent/polaris-capture --stdout")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_reports_stderr_on_silent_exit() {
        let cmd = sh("echo '*** Error: No camera found. ***' >&2; exit 1");
        let err = CameraProcess::start(&cmd, &probe(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::CameraNotFound);
        assert_eq!(err.detail(), "*** Error: No camera found. ***");
    }

    #[tokio::test]
    async fn test_probe_times_out_on_stuck_process() {
        let settings = ProbeSettings {
            deadline: Duration::from_millis(200),
            ..probe()
        };
        let err = CameraProcess::start(&sh("exec sleep 30"), &settings, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::StartupFailure);
        assert!(err.detail().contains("no stream"), "{}", err.detail());
    }

    #[tokio::test]
    async fn test_probe_keeps_prefix_bytes() {
        // Two separate writes so both probe reads see data
        let cmd = sh("printf 'abc'; sleep 0.2; printf 'def'; exec sleep 30");
        let startup = CameraProcess::start(&cmd, &probe(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(startup.prefix, b"abcdef");

        let outcome = startup.process.terminate().await;
        assert!(matches!(outcome, TeardownOutcome::Exited(_)), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_sigterm() {
        let cmd = sh("trap '' TERM; printf 'x'; sleep 0.1; printf 'y'; while true; do sleep 1; done");
        let startup = CameraProcess::start(&cmd, &probe(), Duration::from_millis(300))
            .await
            .unwrap();
        let outcome = startup.process.terminate().await;
        assert!(matches!(outcome, TeardownOutcome::Killed), "{outcome:?}");
    }
}
