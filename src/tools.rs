//! Decode-tool resolution.
//!
//! ffmpeg/ffprobe are located exactly once at startup: the system `PATH`
//! first, then (with the `sidecar_ffmpeg` feature) the sidecar-managed
//! binaries with auto-download. Nothing re-probes per call.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{PlayerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

/// Resolved decoder binaries, fixed for the session.
#[derive(Debug, Clone)]
pub struct DecodeTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mode_label: &'static str,
}

pub fn resolve(mode: FfmpegMode) -> Result<DecodeTools> {
    match mode {
        FfmpegMode::System => system_tools(),
        FfmpegMode::Sidecar => sidecar_tools(),
        FfmpegMode::Auto => system_tools().or_else(|_| sidecar_tools()),
    }
}

fn system_tools() -> Result<DecodeTools> {
    let ffmpeg = PathBuf::from("ffmpeg");
    let ffprobe = PathBuf::from("ffprobe");
    verify_runnable(&ffmpeg)?;
    Ok(DecodeTools {
        ffmpeg,
        ffprobe,
        mode_label: "system",
    })
}

#[cfg(feature = "sidecar_ffmpeg")]
fn sidecar_tools() -> Result<DecodeTools> {
    let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
    if !ffmpeg.exists() {
        ffmpeg_sidecar::download::auto_download().map_err(|error| {
            PlayerError::ToolUnavailable(format!(
                "failed to auto-download ffmpeg sidecar binary: {error}"
            ))
        })?;
    }
    let ffprobe = ffmpeg_sidecar::ffprobe::ffprobe_path();
    verify_runnable(&ffmpeg)?;
    Ok(DecodeTools {
        ffmpeg,
        ffprobe,
        mode_label: "sidecar",
    })
}

#[cfg(not(feature = "sidecar_ffmpeg"))]
fn sidecar_tools() -> Result<DecodeTools> {
    Err(PlayerError::ToolUnavailable(
        "ffmpeg not found on PATH and termvid was built without `sidecar_ffmpeg`. \
         Install ffmpeg or rebuild with `--features sidecar_ffmpeg`."
            .to_owned(),
    ))
}

fn verify_runnable(ffmpeg: &Path) -> Result<()> {
    let status = Command::new(ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PlayerError::ToolUnavailable(format!(
            "'{}' exited with {status} when probed with -version",
            ffmpeg.display()
        ))),
        Err(error) => Err(PlayerError::ToolUnavailable(format!(
            "'{}' could not be run: {error}",
            ffmpeg.display()
        ))),
    }
}
