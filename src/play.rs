//! The render loop: consumes frames from either path and drives the
//! display at the clock's pace.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::FrameBuffer;
use crate::clock::{PlaybackClock, PlaybackPhase};
use crate::display::{CellWriter, PlayerKey};
use crate::error::Result;
use crate::grid::RenderedGrid;
use crate::perf::PerformanceFeedback;
use crate::prerender::PreRenderCache;
use crate::source::SourceStatus;
use crate::transform::FrameTransform;

const FETCH_TIMEOUT: Duration = Duration::from_millis(100);
const STALL_RETRY_WAIT: Duration = Duration::from_millis(50);
/// Bounded retries on an empty feed before declaring a stall (~2s).
const MAX_STALL_RETRIES: u32 = 40;
const PAUSE_POLL: Duration = Duration::from_millis(100);
/// Re-evaluate adaptive parameters every this many rendered frames.
const ADAPT_INTERVAL: u64 = 10;

/// Where the loop gets its grids from.
pub enum FrameFeed<'a> {
    /// Decode-as-you-go: frames from the bounded buffer, rendered inline.
    Live {
        buffer: Arc<FrameBuffer>,
        status: Arc<SourceStatus>,
        transform: &'a dyn FrameTransform,
        cols: u16,
        rows: u16,
    },
    /// Everything rendered ahead of time; fetch by index.
    Prerendered { cache: &'a PreRenderCache },
}

/// Static context for the status line.
pub struct StatusContext {
    pub label: String,
    pub total_frames: u64,
    /// Clip duration in seconds; 0 = unknown.
    pub duration: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackSummary {
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub achieved_fps: f64,
    /// The feed ran dry and never recovered.
    pub stalled: bool,
    /// The clip played through to its end (vs. quit or stall).
    pub natural_end: bool,
}

fn apply_key(clock: &mut PlaybackClock, adaptive_enabled: &mut bool, key: PlayerKey) {
    let now = Instant::now();
    match key {
        PlayerKey::Quit => clock.stop(),
        PlayerKey::TogglePause => clock.toggle_pause(now),
        PlayerKey::ToggleSync => {
            clock.toggle_sync();
        }
        PlayerKey::ToggleAdaptive => *adaptive_enabled = !*adaptive_enabled,
        PlayerKey::FpsUp => clock.adjust_fps(2.0, now),
        PlayerKey::FpsDown => clock.adjust_fps(-2.0, now),
    }
}

/// Drive playback until natural end, stall, or stop.
pub fn run_playback(
    feed: &FrameFeed<'_>,
    writer: &mut dyn CellWriter,
    clock: &mut PlaybackClock,
    perf: &mut PerformanceFeedback,
    mut adaptive_enabled: bool,
    poll_keys: &mut dyn FnMut(Duration) -> Option<PlayerKey>,
    context: &StatusContext,
) -> Result<PlaybackSummary> {
    let mut stall_retries = 0u32;
    let mut stalled = false;
    let mut natural_end = false;

    'playback: loop {
        match clock.phase() {
            PlaybackPhase::Stopped => break,
            PlaybackPhase::Paused => {
                if let Some(key) = poll_keys(PAUSE_POLL) {
                    apply_key(clock, &mut adaptive_enabled, key);
                }
                continue;
            }
            PlaybackPhase::Playing => {}
        }

        let now = Instant::now();
        let planned = clock.planned_skips(now);

        let grid = match feed {
            FrameFeed::Live {
                buffer,
                status,
                transform,
                cols,
                rows,
            } => {
                if planned > 0 {
                    // Catch-up skips never block; take what is buffered.
                    let skipped = buffer.skip(planned as usize) as u64;
                    clock.note_skipped(skipped);
                }
                match buffer.get(true, FETCH_TIMEOUT) {
                    Some(mut frame) => {
                        stall_retries = 0;
                        transform.apply(&mut frame);
                        RenderedGrid::from_frame(&frame, *cols, *rows)
                    }
                    None => {
                        if status.is_complete() && buffer.is_empty() {
                            natural_end = true;
                            break 'playback;
                        }
                        stall_retries += 1;
                        if stall_retries > MAX_STALL_RETRIES {
                            eprintln!(
                                "[termvid] playback stalled: no frames after {} retries",
                                MAX_STALL_RETRIES
                            );
                            stalled = true;
                            break 'playback;
                        }
                        thread::sleep(STALL_RETRY_WAIT);
                        continue;
                    }
                }
            }
            FrameFeed::Prerendered { cache } => {
                if planned > 0 {
                    // Cached frames are addressed by index; skipping is
                    // just advancing past them.
                    clock.note_skipped(planned);
                }
                let index = clock.current_frame();
                let total = cache.total_frames();
                if total > 0 && index >= total {
                    if clock.looping() {
                        clock.reset_for_loop(Instant::now());
                        continue;
                    }
                    natural_end = true;
                    break 'playback;
                }
                match cache.get(index) {
                    Some(grid) => {
                        stall_retries = 0;
                        grid
                    }
                    None => {
                        if cache.is_finished() {
                            // A failed cache write left a hole; step past it.
                            clock.note_skipped(1);
                            continue;
                        }
                        stall_retries += 1;
                        if stall_retries > MAX_STALL_RETRIES {
                            eprintln!(
                                "[termvid] playback stalled waiting for pre-rendered frame {}",
                                index
                            );
                            stalled = true;
                            break 'playback;
                        }
                        thread::sleep(STALL_RETRY_WAIT);
                        continue;
                    }
                }
            }
        };

        let status_line =
            format_status_line(clock, perf.achieved_fps(), adaptive_enabled, context);
        writer.write(&grid, Some(&status_line))?;
        clock.advance();
        perf.register_frame_rendered();

        if adaptive_enabled && perf.frames_rendered() % ADAPT_INTERVAL == 0 {
            let params = perf.adaptive_parameters();
            clock.apply_adaptive(&params, Instant::now());
            perf.set_target_fps(clock.target_fps());
        }
        if clock.due_for_sync() {
            clock.update_drift(Instant::now(), perf.achieved_fps());
        }

        while let Some(key) = poll_keys(Duration::ZERO) {
            apply_key(clock, &mut adaptive_enabled, key);
        }

        let sleep = clock.sleep_duration(Instant::now());
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
    }

    Ok(PlaybackSummary {
        frames_rendered: perf.frames_rendered(),
        frames_skipped: clock.skip_count(),
        achieved_fps: perf.achieved_fps(),
        stalled,
        natural_end,
    })
}

fn format_mmss(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

fn format_status_line(
    clock: &PlaybackClock,
    achieved_fps: f64,
    adaptive_enabled: bool,
    context: &StatusContext,
) -> String {
    let percent = if context.total_frames > 0 {
        (clock.current_frame() * 100 / context.total_frames).min(100)
    } else {
        0
    };
    let mut time = format_mmss(clock.current_frame() as f64 / clock.target_fps());
    if context.duration > 0.0 {
        time.push('/');
        time.push_str(&format_mmss(context.duration));
    }
    let skipped = if clock.skip_count() > 0 {
        format!(" -SK:{}", clock.skip_count())
    } else {
        String::new()
    };
    let sync = if clock.sync_enabled() { "S" } else { "NS" };
    let adapt = if adaptive_enabled {
        format!(" A:{:.1}", clock.smoothness())
    } else {
        String::new()
    };
    let paused = if clock.phase() == PlaybackPhase::Paused {
        "PAUSED "
    } else {
        ""
    };
    format!(
        "[{paused}{percent}% | {time} | {achieved_fps:.1} FPS{skipped} | {sync}{adapt}] {}",
        context.label
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOptions;

    #[test]
    fn mmss_formats_whole_minutes() {
        assert_eq!(format_mmss(0.0), "00:00");
        assert_eq!(format_mmss(65.4), "01:05");
        assert_eq!(format_mmss(-3.0), "00:00");
    }

    #[test]
    fn status_line_carries_progress_and_modes() {
        let mut clock = PlaybackClock::new(ClockOptions::new(24.0), Instant::now());
        for _ in 0..120 {
            clock.advance();
        }
        clock.note_skipped(4);
        let context = StatusContext {
            label: "clip.mp4".to_owned(),
            total_frames: 248,
            duration: 10.0,
        };
        let line = format_status_line(&clock, 23.4, true, &context);
        assert!(line.starts_with("[50% | 00:05/00:10 | 23.4 FPS -SK:4 | S A:"));
        assert!(line.ends_with("] clip.mp4"));
    }

    #[test]
    fn status_line_handles_unknown_totals() {
        let clock = PlaybackClock::new(ClockOptions::new(24.0), Instant::now());
        let context = StatusContext {
            label: "stream".to_owned(),
            total_frames: 0,
            duration: 0.0,
        };
        let line = format_status_line(&clock, 24.0, false, &context);
        assert!(line.starts_with("[0% | 00:00 | 24.0 FPS | S]"));
    }
}
