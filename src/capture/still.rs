//! One-shot camera commands: fetching stored pictures and releasing the
//! camera UI lock left behind by a liveview session.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, info};

use crate::capture::error::{CaptureError, Result};
use crate::utils::{format_command, substitute};
use crate::StillConfig;

/// Run a command to completion, capturing its output
pub async fn run_command(command: &[String]) -> Result<Output> {
    let (program, args) = command.split_first().ok_or(CaptureError::EmptyCommand)?;
    let cmdline = format_command(command);
    info!("Executing: {}", cmdline);

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CaptureError::Spawn {
            command: cmdline,
            source,
        })
}

fn failure(output: &Output) -> CaptureError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    if stderr.is_empty() {
        CaptureError::StillCapture(format!("command exited with {}", output.status))
    } else {
        CaptureError::StillCapture(stderr)
    }
}

/// Clear the "PC connected" lock on the camera's own screen.
///
/// An empty command means there is nothing to unlock.
pub async fn unlock_camera(command: &[String]) -> Result<()> {
    if command.is_empty() {
        return Ok(());
    }
    let output = run_command(command).await?;
    if !output.status.success() {
        return Err(failure(&output));
    }
    Ok(())
}

/// Accept only a plain file name, never a path
pub fn validate_filename(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(name)
    } else {
        Err(CaptureError::StillCapture(format!("invalid file name: {:?}", name)))
    }
}

pub fn cached_path(config: &StillConfig, name: &str) -> Result<PathBuf> {
    Ok(config.cache_dir.join(validate_filename(name)?))
}

/// Picture bytes from the local cache, downloading from the camera on a miss
pub async fn fetch_picture(config: &StillConfig, name: &str) -> Result<Bytes> {
    let path = cached_path(config, name)?;
    if let Ok(data) = tokio::fs::read(&path).await {
        debug!("Serving {} from cache", path.display());
        return Ok(Bytes::from(data));
    }

    tokio::fs::create_dir_all(&config.cache_dir).await?;
    let partial = partial_path(&path);
    let output = partial.to_string_lossy().into_owned();
    let command = substitute(
        &config.get_file_command,
        &[("filename", name), ("output", &output)],
    );
    let result = run_command(&command).await?;
    if !result.status.success() {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(failure(&result));
    }

    // Only complete downloads enter the cache
    tokio::fs::rename(&partial, &path).await.map_err(|e| {
        CaptureError::StillCapture(format!("camera did not produce {}: {}", name, e))
    })?;
    info!("Cached {}", path.display());
    Ok(Bytes::from(tokio::fs::read(&path).await?))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
