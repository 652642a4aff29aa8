//! Playback performance feedback.
//!
//! A rolling window of inter-frame wall-clock deltas yields the achieved
//! frame rate; a one-shot platform probe classifies the host into a coarse
//! capability tier. Both feed the adaptive parameters consumed (and phased
//! in) by the playback clock.

use std::collections::VecDeque;
use std::time::Instant;

pub const DEFAULT_WINDOW_SIZE: usize = 30;

/// Floor applied to the adaptive frame-rate under heavy overload.
const MIN_ADAPTIVE_FPS: f64 = 12.0;

/// Coarse host rendering-throughput class, fixed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityTier {
    Low,
    Medium,
    High,
}

impl CapabilityTier {
    /// Cap the requested frame rate for the tier.
    pub fn optimal_fps(self, target_fps: f64) -> f64 {
        match self {
            CapabilityTier::Low => target_fps.min(15.0),
            CapabilityTier::Medium => target_fps.min(24.0),
            CapabilityTier::High => target_fps,
        }
    }
}

/// Advisory outputs for the playback clock. Never applied instantaneously.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveParams {
    pub fps: f64,
    pub smoothness: f64,
    pub skip_ratio: f64,
}

/// Compute adaptive parameters from achieved vs. target frame rate.
pub fn adaptive_parameters(achieved_fps: f64, target_fps: f64) -> AdaptiveParams {
    if target_fps <= 0.0 {
        return AdaptiveParams {
            fps: target_fps,
            smoothness: 1.0,
            skip_ratio: 0.0,
        };
    }
    let ratio = achieved_fps / target_fps;
    if ratio > 0.85 {
        AdaptiveParams {
            fps: target_fps,
            smoothness: 1.0,
            skip_ratio: 0.0,
        }
    } else if ratio > 0.6 {
        AdaptiveParams {
            fps: target_fps * 0.9,
            smoothness: 0.9,
            skip_ratio: 0.1,
        }
    } else {
        AdaptiveParams {
            fps: (achieved_fps * 1.1).max(MIN_ADAPTIVE_FPS),
            smoothness: 0.8,
            skip_ratio: 0.2,
        }
    }
}

/// Probe the host once for its capability tier.
///
/// musl/Alpine and iSH-style terminals rate Low, ARM and WSL Medium,
/// everything else High. Unknown platforms default to High.
pub fn detect_capability() -> CapabilityTier {
    if is_limited_platform() {
        return CapabilityTier::Low;
    }
    let arch = std::env::consts::ARCH;
    if arch.contains("arm") || arch.contains("aarch64") || is_wsl() {
        return CapabilityTier::Medium;
    }
    CapabilityTier::High
}

#[cfg(target_os = "linux")]
fn is_limited_platform() -> bool {
    if std::path::Path::new("/etc/alpine-release").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/version")
        .map(|version| {
            let version = version.to_lowercase();
            version.contains("musl") || version.contains("ish")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_limited_platform() -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|version| version.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_wsl() -> bool {
    false
}

pub struct PerformanceFeedback {
    window: VecDeque<f64>,
    window_size: usize,
    last_frame_at: Option<Instant>,
    frames_rendered: u64,
    target_fps: f64,
    tier: CapabilityTier,
}

impl PerformanceFeedback {
    pub fn new(target_fps: f64) -> Self {
        Self::with_tier(target_fps, detect_capability())
    }

    pub fn with_tier(target_fps: f64, tier: CapabilityTier) -> Self {
        Self {
            window: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE),
            window_size: DEFAULT_WINDOW_SIZE,
            last_frame_at: None,
            frames_rendered: 0,
            target_fps,
            tier,
        }
    }

    pub fn capability_tier(&self) -> CapabilityTier {
        self.tier
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn set_target_fps(&mut self, target_fps: f64) {
        self.target_fps = target_fps;
    }

    /// Record that a frame was just rendered.
    pub fn register_frame_rendered(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_frame_at {
            self.push_delta(now.duration_since(previous).as_secs_f64());
        }
        self.last_frame_at = Some(now);
        self.frames_rendered += 1;
    }

    fn push_delta(&mut self, delta: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(delta);
    }

    /// 1 / mean(window). Reports the target rate until samples exist.
    pub fn achieved_fps(&self) -> f64 {
        if self.window.is_empty() {
            return self.target_fps;
        }
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        if mean > 0.0 {
            1.0 / mean
        } else {
            self.target_fps
        }
    }

    /// Advisory parameters for the current window against the tier-capped
    /// target.
    pub fn adaptive_parameters(&self) -> AdaptiveParams {
        adaptive_parameters(self.achieved_fps(), self.tier.optimal_fps(self.target_fps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback_with_deltas(target: f64, deltas: &[f64]) -> PerformanceFeedback {
        let mut feedback = PerformanceFeedback::with_tier(target, CapabilityTier::High);
        for &delta in deltas {
            feedback.push_delta(delta);
        }
        feedback
    }

    #[test]
    fn achieved_fps_is_inverse_mean_of_window() {
        let feedback = feedback_with_deltas(24.0, &[0.05; 10]);
        assert!((feedback.achieved_fps() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_target() {
        let feedback = feedback_with_deltas(24.0, &[]);
        assert_eq!(feedback.achieved_fps(), 24.0);
    }

    #[test]
    fn window_is_bounded() {
        let mut feedback = PerformanceFeedback::with_tier(24.0, CapabilityTier::High);
        for _ in 0..200 {
            feedback.push_delta(0.04);
        }
        assert_eq!(feedback.window.len(), DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn near_target_playback_keeps_standard_parameters() {
        let params = adaptive_parameters(23.0, 24.0);
        assert_eq!(params.fps, 24.0);
        assert_eq!(params.smoothness, 1.0);
        assert_eq!(params.skip_ratio, 0.0);
    }

    #[test]
    fn moderate_shortfall_backs_off_ten_percent() {
        // ratio 20/24 = 0.833...
        let params = adaptive_parameters(20.0, 24.0);
        assert!((params.fps - 21.6).abs() < 1e-9);
        assert_eq!(params.smoothness, 0.9);
        assert_eq!(params.skip_ratio, 0.1);
    }

    #[test]
    fn heavy_overload_tracks_achieved_rate_with_floor() {
        let params = adaptive_parameters(10.0, 24.0);
        assert!((params.fps - 12.0).abs() < 1e-9);
        assert_eq!(params.smoothness, 0.8);
        assert_eq!(params.skip_ratio, 0.2);

        let params = adaptive_parameters(13.0, 24.0);
        assert!((params.fps - 14.3).abs() < 1e-9);
    }

    #[test]
    fn tier_caps_optimal_fps() {
        assert_eq!(CapabilityTier::Low.optimal_fps(30.0), 15.0);
        assert_eq!(CapabilityTier::Medium.optimal_fps(30.0), 24.0);
        assert_eq!(CapabilityTier::High.optimal_fps(30.0), 30.0);
        assert_eq!(CapabilityTier::Low.optimal_fps(10.0), 10.0);
    }
}
