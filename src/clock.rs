//! The playback scheduling core.
//!
//! Maps wall-clock elapsed time to a target frame index, decides catch-up
//! skips, applies bounded drift correction, and computes the end-of-tick
//! sleep. All methods take `now` explicitly so scheduling decisions stay
//! testable without sleeping.

use std::time::{Duration, Instant};

use crate::perf::AdaptiveParams;

pub const DEFAULT_SKIP_CAP: u64 = 4;
pub const DEFAULT_SYNC_INTERVAL: u64 = 30;
pub const DEFAULT_MAX_CORRECTION: f64 = 0.5;

pub const MIN_TARGET_FPS: f64 = 5.0;
pub const MAX_TARGET_FPS: f64 = 60.0;

/// Drift below this magnitude is left alone.
const DRIFT_EPSILON: f64 = 0.05;
/// Fraction of measured drift corrected per adjustment.
const DRIFT_GAIN: f64 = 0.1;
/// Overload detection: achieved under this fraction of target...
const OVERLOAD_FPS_RATIO: f64 = 0.7;
/// ...with drift beyond this suspends correction in favor of skipping.
const OVERLOAD_DRIFT: f64 = 0.5;
/// Weight of a newly advised smoothness value when phasing it in.
const ADAPT_BLEND: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockOptions {
    pub target_fps: f64,
    pub skip_cap: u64,
    pub sync_interval: u64,
    pub max_correction: f64,
    pub sync_enabled: bool,
    pub looping: bool,
}

impl ClockOptions {
    pub fn new(target_fps: f64) -> Self {
        Self {
            target_fps,
            skip_cap: DEFAULT_SKIP_CAP,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_correction: DEFAULT_MAX_CORRECTION,
            sync_enabled: true,
            looping: false,
        }
    }
}

pub struct PlaybackClock {
    phase: PlaybackPhase,
    start_wallclock: Instant,
    /// Position in the frame stream: rendered and skipped frames both
    /// advance it, so elapsed-time math converges after a catch-up.
    current_frame: u64,
    drift_correction: f64,
    skip_count: u64,
    target_fps: f64,
    smoothness: f64,
    skip_cap: u64,
    sync_interval: u64,
    max_correction: f64,
    sync_enabled: bool,
    looping: bool,
}

impl PlaybackClock {
    pub fn new(options: ClockOptions, now: Instant) -> Self {
        Self {
            phase: PlaybackPhase::Playing,
            start_wallclock: now,
            current_frame: 0,
            drift_correction: 0.0,
            skip_count: 0,
            target_fps: options.target_fps.clamp(MIN_TARGET_FPS, MAX_TARGET_FPS),
            smoothness: 1.0,
            skip_cap: options.skip_cap,
            sync_interval: options.sync_interval.max(1),
            max_correction: options.max_correction,
            sync_enabled: options.sync_enabled,
            looping: options.looping,
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn skip_count(&self) -> u64 {
        self.skip_count
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    pub fn smoothness(&self) -> f64 {
        self.smoothness
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn toggle_sync(&mut self) -> bool {
        self.sync_enabled = !self.sync_enabled;
        self.sync_enabled
    }

    pub fn pause(&mut self) {
        if self.phase == PlaybackPhase::Playing {
            self.phase = PlaybackPhase::Paused;
        }
    }

    /// Resume and re-anchor the wall clock so elapsed-time math stays
    /// consistent across the pause.
    pub fn resume(&mut self, now: Instant) {
        if self.phase != PlaybackPhase::Paused {
            return;
        }
        self.phase = PlaybackPhase::Playing;
        self.reanchor(now);
    }

    pub fn toggle_pause(&mut self, now: Instant) {
        match self.phase {
            PlaybackPhase::Playing => self.pause(),
            PlaybackPhase::Paused => self.resume(now),
            PlaybackPhase::Stopped => {}
        }
    }

    /// Terminal and idempotent from any state.
    pub fn stop(&mut self) {
        self.phase = PlaybackPhase::Stopped;
    }

    /// Change the target rate at runtime (clamped), re-anchoring so the
    /// already-played portion is not re-timed.
    pub fn set_target_fps(&mut self, fps: f64, now: Instant) {
        self.target_fps = fps.clamp(MIN_TARGET_FPS, MAX_TARGET_FPS);
        self.reanchor(now);
    }

    pub fn adjust_fps(&mut self, delta: f64, now: Instant) {
        self.set_target_fps(self.target_fps + delta, now);
    }

    fn reanchor(&mut self, now: Instant) {
        let played = Duration::from_secs_f64(self.current_frame as f64 / self.target_fps);
        self.start_wallclock = now - played;
        self.drift_correction = 0.0;
    }

    pub fn elapsed(&self, now: Instant) -> f64 {
        now.duration_since(self.start_wallclock).as_secs_f64()
    }

    /// Frame index the wall clock says we should be showing.
    pub fn target_index(&self, now: Instant) -> u64 {
        (self.elapsed(now) * self.target_fps).floor() as u64
    }

    /// How many buffered frames to discard this tick to catch up; never
    /// more than `skip_cap`, and always leaving one frame to render.
    pub fn planned_skips(&self, now: Instant) -> u64 {
        let target = self.target_index(now);
        let behind = target.saturating_sub(self.current_frame);
        if behind > 1 {
            (behind - 1).min(self.skip_cap)
        } else {
            0
        }
    }

    /// Record frames discarded by a catch-up; they advance the stream
    /// position just like rendered frames.
    pub fn note_skipped(&mut self, count: u64) {
        self.skip_count += count;
        self.current_frame += count;
    }

    /// Record a rendered frame.
    pub fn advance(&mut self) {
        self.current_frame += 1;
    }

    /// True on the ticks where drift should be recomputed.
    pub fn due_for_sync(&self) -> bool {
        self.sync_enabled
            && self.current_frame > 0
            && self.current_frame % self.sync_interval == 0
    }

    /// Recompute drift and apply one bounded correction step. Returns the
    /// measured drift in seconds for diagnostics.
    ///
    /// Under sustained overload the correction is zeroed instead: skipping
    /// (step 2 of the tick) recovers faster than timing games, and the two
    /// fighting each other oscillates.
    pub fn update_drift(&mut self, now: Instant, achieved_fps: f64) -> f64 {
        let ideal = self.current_frame as f64 / self.target_fps;
        let drift = self.elapsed(now) - ideal;
        if drift.abs() <= DRIFT_EPSILON {
            return drift;
        }
        let overloaded = achieved_fps < self.target_fps * OVERLOAD_FPS_RATIO
            && drift > OVERLOAD_DRIFT;
        if overloaded {
            self.drift_correction = 0.0;
        } else {
            let correction =
                (-drift * DRIFT_GAIN).clamp(-self.max_correction, self.max_correction);
            self.drift_correction += correction;
        }
        drift
    }

    pub fn drift_correction(&self) -> f64 {
        self.drift_correction
    }

    /// Phase advisory parameters in rather than snapping to them.
    pub fn apply_adaptive(&mut self, params: &AdaptiveParams, now: Instant) {
        self.smoothness =
            self.smoothness * (1.0 - ADAPT_BLEND) + params.smoothness * ADAPT_BLEND;
        if (params.fps - self.target_fps).abs() > 0.5 {
            let blended = self.target_fps * (1.0 - ADAPT_BLEND) + params.fps * ADAPT_BLEND;
            self.set_target_fps(blended, now);
        }
    }

    /// End-of-tick sleep: until the corrected deadline of the next frame,
    /// scaled by the smoothness factor.
    pub fn sleep_duration(&self, now: Instant) -> Duration {
        let deadline = self.current_frame as f64 / self.target_fps + self.drift_correction;
        let remaining = deadline - self.elapsed(now);
        if remaining <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(remaining * self.smoothness)
    }

    /// Loop restart: rewind to frame zero with a fresh anchor.
    pub fn reset_for_loop(&mut self, now: Instant) {
        self.current_frame = 0;
        self.start_wallclock = now;
        self.drift_correction = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_at(target_fps: f64) -> (PlaybackClock, Instant) {
        let now = Instant::now();
        (PlaybackClock::new(ClockOptions::new(target_fps), now), now)
    }

    #[test]
    fn target_index_follows_elapsed_time() {
        let (clock, start) = clock_at(24.0);
        assert_eq!(clock.target_index(start), 0);
        assert_eq!(clock.target_index(start + Duration::from_secs(2)), 48);
    }

    #[test]
    fn planned_skips_leave_one_frame_and_respect_cap() {
        let (clock, start) = clock_at(24.0);
        // exactly one behind: render, no skip
        assert_eq!(clock.planned_skips(start + Duration::from_millis(42)), 0);
        // three behind: skip two
        assert_eq!(clock.planned_skips(start + Duration::from_millis(125)), 2);
        // far behind: capped
        assert_eq!(clock.planned_skips(start + Duration::from_secs(10)), DEFAULT_SKIP_CAP);
    }

    #[test]
    fn skipping_advances_stream_position() {
        let (mut clock, start) = clock_at(24.0);
        let later = start + Duration::from_secs(1);
        let skips = clock.planned_skips(later);
        clock.note_skipped(skips);
        clock.advance();
        assert_eq!(clock.skip_count(), skips);
        assert_eq!(clock.current_frame(), skips + 1);
        // after catching up the plan shrinks
        assert!(clock.planned_skips(later) < skips + 1);
    }

    #[test]
    fn drift_correction_is_bounded_per_adjustment() {
        let (mut clock, start) = clock_at(24.0);
        // 90 frames rendered but a full minute elapsed: enormous drift
        for _ in 0..90 {
            clock.advance();
        }
        let drift = clock.update_drift(start + Duration::from_secs(60), 24.0);
        assert!(drift > 50.0);
        assert!(clock.drift_correction().abs() <= DEFAULT_MAX_CORRECTION + 1e-9);
    }

    #[test]
    fn small_drift_is_ignored() {
        let (mut clock, start) = clock_at(24.0);
        for _ in 0..24 {
            clock.advance();
        }
        clock.update_drift(start + Duration::from_millis(1020), 24.0);
        assert_eq!(clock.drift_correction(), 0.0);
    }

    #[test]
    fn sustained_overload_suspends_correction() {
        let (mut clock, start) = clock_at(24.0);
        for _ in 0..30 {
            clock.advance();
        }
        // 30 frames in 2s = drift 0.75s, achieved 15fps < 0.7*24
        let now = start + Duration::from_secs(2);
        clock.update_drift(now, 15.0);
        assert_eq!(clock.drift_correction(), 0.0);
        // a healthy system with the same drift does correct
        clock.update_drift(now, 24.0);
        assert!(clock.drift_correction() != 0.0);
    }

    #[test]
    fn resume_reanchors_elapsed_math() {
        let (mut clock, start) = clock_at(24.0);
        for _ in 0..48 {
            clock.advance();
        }
        clock.pause();
        assert_eq!(clock.phase(), PlaybackPhase::Paused);
        // resume long after; position must still map to 2 seconds in
        let resumed_at = start + Duration::from_secs(600);
        clock.resume(resumed_at);
        assert_eq!(clock.phase(), PlaybackPhase::Playing);
        assert!((clock.elapsed(resumed_at) - 2.0).abs() < 1e-6);
        assert_eq!(clock.target_index(resumed_at), 48);
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let (mut clock, now) = clock_at(24.0);
        clock.stop();
        clock.stop();
        assert_eq!(clock.phase(), PlaybackPhase::Stopped);
        clock.resume(now);
        assert_eq!(clock.phase(), PlaybackPhase::Stopped);
        clock.toggle_pause(now);
        assert_eq!(clock.phase(), PlaybackPhase::Stopped);
    }

    #[test]
    fn fps_adjustments_clamp_and_reanchor() {
        let (mut clock, start) = clock_at(24.0);
        for _ in 0..24 {
            clock.advance();
        }
        let now = start + Duration::from_secs(1);
        clock.set_target_fps(200.0, now);
        assert_eq!(clock.target_fps(), MAX_TARGET_FPS);
        // position still maps consistently: 24 frames at 60fps = 0.4s
        assert!((clock.elapsed(now) - 0.4).abs() < 1e-6);
        clock.adjust_fps(-100.0, now);
        assert_eq!(clock.target_fps(), MIN_TARGET_FPS);
    }

    #[test]
    fn sleep_scales_with_smoothness() {
        let (mut clock, start) = clock_at(10.0);
        clock.advance(); // next deadline 0.1s
        let full = clock.sleep_duration(start);
        assert!((full.as_secs_f64() - 0.1).abs() < 1e-6);
        clock.smoothness = 0.5;
        let scaled = clock.sleep_duration(start);
        assert!((scaled.as_secs_f64() - 0.05).abs() < 1e-6);
        // past the deadline: no sleep
        assert_eq!(
            clock.sleep_duration(start + Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn adaptive_parameters_phase_in_gradually() {
        let (mut clock, now) = clock_at(24.0);
        let params = AdaptiveParams {
            fps: 12.0,
            smoothness: 0.8,
            skip_ratio: 0.2,
        };
        clock.apply_adaptive(&params, now);
        // blended, not snapped
        assert!(clock.smoothness() > 0.8 && clock.smoothness() < 1.0);
        assert!(clock.target_fps() > 12.0 && clock.target_fps() < 24.0);
    }

    #[test]
    fn sync_cadence_matches_interval() {
        let (mut clock, _) = clock_at(24.0);
        let mut due = 0;
        for _ in 0..90 {
            clock.advance();
            if clock.due_for_sync() {
                due += 1;
            }
        }
        assert_eq!(due, 3);
        clock.toggle_sync();
        assert!(!clock.due_for_sync());
    }

    #[test]
    fn loop_reset_rewinds_cleanly() {
        let (mut clock, start) = clock_at(24.0);
        for _ in 0..100 {
            clock.advance();
        }
        let now = start + Duration::from_secs(5);
        clock.reset_for_loop(now);
        assert_eq!(clock.current_frame(), 0);
        assert_eq!(clock.target_index(now), 0);
        assert_eq!(clock.drift_correction(), 0.0);
    }
}
