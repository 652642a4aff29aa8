//! Video metadata via ffprobe.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::error::{PlayerError, Result};
use crate::tools::DecodeTools;

pub const DEFAULT_FPS: f64 = 24.0;

/// Structured metadata for the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Seconds; 0.0 when the container reports none.
    pub duration: f64,
}

impl VideoMetadata {
    /// Degraded-mode defaults used when probing fails: playback proceeds,
    /// total-frame estimates become approximate.
    pub fn fallback(fps: f64) -> Self {
        Self {
            width: 0,
            height: 0,
            fps,
            duration: 0.0,
        }
    }

    /// Estimated frame count for a clip window at `fps`, 0 when unknown.
    pub fn estimated_frames(&self, fps: f64, start_time: f64, duration: Option<f64>) -> u64 {
        if self.duration <= 0.0 {
            return 0;
        }
        let available = (self.duration - start_time).max(0.0);
        let span = match duration {
            Some(requested) => requested.min(available),
            None => available,
        };
        (span * fps).floor() as u64
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe `path` for width/height/frame-rate/duration.
///
/// A `ProbeFailed` error here is non-fatal to playback; callers fall back to
/// `VideoMetadata::fallback`.
pub fn probe(tools: &DecodeTools, path: &Path) -> Result<VideoMetadata> {
    let failed = |reason: String| PlayerError::ProbeFailed {
        path: path.to_path_buf(),
        reason,
    };

    let output = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|error| failed(format!("failed to run ffprobe: {error}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failed(format!(
            "ffprobe exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|error| failed(format!("unparsable ffprobe output: {error}")))?;

    let stream = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| failed("no video stream found".to_owned()))?;

    let width = stream
        .width
        .ok_or_else(|| failed("video stream has no width".to_owned()))?;
    let height = stream
        .height
        .ok_or_else(|| failed("video stream has no height".to_owned()))?;
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .unwrap_or(DEFAULT_FPS);
    let duration = parsed
        .format
        .and_then(|format| format.duration)
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoMetadata {
        width,
        height,
        fps,
        duration,
    })
}

/// Parse ffprobe's rational frame rate (`num/den`), guarding den == 0.
fn parse_rational(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.trim().parse::<f64>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_frame_rates_parse() {
        assert_eq!(parse_rational("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_rational("25/1"), Some(25.0));
        assert_eq!(parse_rational("24"), Some(24.0));
        assert_eq!(parse_rational("10/0"), None);
        assert_eq!(parse_rational("x/y"), None);
    }

    #[test]
    fn estimated_frames_respects_clip_window() {
        let meta = VideoMetadata {
            width: 640,
            height: 480,
            fps: 24.0,
            duration: 10.0,
        };
        assert_eq!(meta.estimated_frames(24.0, 0.0, None), 240);
        assert_eq!(meta.estimated_frames(24.0, 4.0, None), 144);
        assert_eq!(meta.estimated_frames(24.0, 4.0, Some(2.0)), 48);
        assert_eq!(meta.estimated_frames(24.0, 20.0, None), 0);
    }

    #[test]
    fn fallback_metadata_reports_unknown_totals() {
        let meta = VideoMetadata::fallback(24.0);
        assert_eq!(meta.estimated_frames(24.0, 0.0, None), 0);
    }

    #[test]
    fn probe_json_shape_is_understood() {
        let raw = r#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1280, "height": 720,
                 "r_frame_rate": "24000/1001"}
            ],
            "format": {"duration": "42.5"}
        }"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).unwrap();
        let stream = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .unwrap();
        assert_eq!(stream.width, Some(1280));
        assert_eq!(
            parsed.format.unwrap().duration.as_deref(),
            Some("42.5")
        );
    }
}
