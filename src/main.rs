use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use termvid::buffer::Preload;
use termvid::clock::{ClockOptions, PlaybackClock};
use termvid::display::TerminalDisplay;
use termvid::memory::{estimate_prerender_bytes, format_bytes, MemoryGuard};
use termvid::perf::{detect_capability, CapabilityTier, PerformanceFeedback};
use termvid::play::{run_playback, FrameFeed, PlaybackSummary, StatusContext};
use termvid::prerender::{PreRenderCache, PreRenderConfig};
use termvid::probe::{probe, VideoMetadata, DEFAULT_FPS};
use termvid::quantize::DitherMode;
use termvid::source::{extract_file_sequence, FrameSource, SourceConfig};
use termvid::tools::{resolve, FfmpegMode};
use termvid::transform::{QualityLevel, QualityTransform};

fn long_version() -> String {
    match option_env!("TERMVID_GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    }
}

static LONG_VERSION: std::sync::LazyLock<String> = std::sync::LazyLock::new(long_version);

#[derive(Debug, Parser)]
#[command(name = "termvid")]
#[command(about = "Half-block video playback for 256-color terminals")]
#[command(version = LONG_VERSION.as_str())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Play a video file in the terminal
    Play {
        file: PathBuf,
        /// Target frame rate (defaults to the clip's native rate)
        #[arg(long)]
        fps: Option<f64>,
        /// Start offset in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Clip duration in seconds (defaults to the rest of the file)
        #[arg(long)]
        duration: Option<f64>,
        /// Render everything before playing
        #[arg(long)]
        prerender: bool,
        /// Rendering quality (defaults to the host capability tier)
        #[arg(long, value_enum)]
        quality: Option<QualityArg>,
        /// Dithering override
        #[arg(long, value_enum, default_value = "auto")]
        dither: DitherArg,
        /// Disable drift correction
        #[arg(long = "no-sync")]
        no_sync: bool,
        /// Disable adaptive frame-rate/smoothness
        #[arg(long = "no-adaptive")]
        no_adaptive: bool,
        /// Restart from the beginning at the end of the clip
        #[arg(long = "loop")]
        looping: bool,
        /// Keep the pre-render cache directory after exit
        #[arg(long = "keep-cache")]
        keep_cache: bool,
        /// Frame buffer capacity
        #[arg(long = "buffer-capacity", default_value_t = 30)]
        buffer_capacity: usize,
        /// Frames to buffer before playback starts
        #[arg(long = "preload", default_value_t = 10)]
        preload: usize,
    },
    /// Print probed metadata for a video file
    Probe { file: PathBuf },
    /// Extract frames to a directory without playing
    Extract {
        file: PathBuf,
        #[arg(short = 'o', long = "out")]
        out: PathBuf,
        #[arg(long)]
        fps: Option<f64>,
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long)]
        duration: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QualityArg {
    Low,
    Medium,
    High,
}

impl From<QualityArg> for QualityLevel {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::Low => QualityLevel::Low,
            QualityArg::Medium => QualityLevel::Medium,
            QualityArg::High => QualityLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DitherArg {
    /// Follow the quality level
    Auto,
    None,
    Ordered,
    /// Floyd-Steinberg error diffusion
    Fs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Play {
            file,
            fps,
            start,
            duration,
            prerender,
            quality,
            dither,
            no_sync,
            no_adaptive,
            looping,
            keep_cache,
            buffer_capacity,
            preload,
        } => run_play(PlayArgs {
            file,
            fps,
            start,
            duration,
            prerender,
            quality,
            dither,
            no_sync,
            no_adaptive,
            looping,
            keep_cache,
            buffer_capacity,
            preload,
        }),
        Commands::Probe { file } => run_probe(&file),
        Commands::Extract {
            file,
            out,
            fps,
            start,
            duration,
        } => run_extract(&file, &out, fps, start, duration),
    }
}

struct PlayArgs {
    file: PathBuf,
    fps: Option<f64>,
    start: f64,
    duration: Option<f64>,
    prerender: bool,
    quality: Option<QualityArg>,
    dither: DitherArg,
    no_sync: bool,
    no_adaptive: bool,
    looping: bool,
    keep_cache: bool,
    buffer_capacity: usize,
    preload: usize,
}

/// Probe with graceful degradation: a failed probe logs and falls back to
/// defaults rather than aborting.
fn probe_or_fallback(
    tools: &termvid::tools::DecodeTools,
    path: &Path,
    requested_fps: Option<f64>,
) -> VideoMetadata {
    match probe(tools, path) {
        Ok(metadata) => metadata,
        Err(error) => {
            eprintln!("[termvid] {error}; using fallback defaults");
            VideoMetadata::fallback(requested_fps.unwrap_or(DEFAULT_FPS))
        }
    }
}

/// Fit the source raster into the cell canvas (pixel height = 2 rows),
/// preserving aspect ratio. Unknown source dimensions fill the canvas.
fn fit_target(metadata: &VideoMetadata, cols: u16, pixel_rows: u32) -> (u32, u32) {
    let canvas_w = u32::from(cols).max(2);
    let canvas_h = pixel_rows.max(2);
    if metadata.width == 0 || metadata.height == 0 {
        return (canvas_w, canvas_h & !1);
    }
    let scale = (canvas_w as f64 / metadata.width as f64)
        .min(canvas_h as f64 / metadata.height as f64);
    let width = ((metadata.width as f64 * scale).round() as u32).clamp(2, canvas_w);
    let height = ((metadata.height as f64 * scale).round() as u32).clamp(2, canvas_h);
    (width, height & !1)
}

fn run_play(args: PlayArgs) -> Result<()> {
    let tools = resolve(FfmpegMode::Auto).context("cannot play video without a decoder")?;
    let metadata = probe_or_fallback(&tools, &args.file, args.fps);
    let target_fps = args.fps.unwrap_or(if metadata.fps > 0.0 {
        metadata.fps
    } else {
        DEFAULT_FPS
    });

    let (term_cols, term_rows) = TerminalDisplay::size().context("no terminal size available")?;
    let grid_rows = term_rows.saturating_sub(1).max(1);
    let (width, height) = fit_target(&metadata, term_cols, u32::from(grid_rows) * 2);

    let mut source_config = SourceConfig::new(args.file.clone(), target_fps, width, height);
    source_config.start_time = args.start;
    source_config.duration = args.duration;
    source_config.buffer_capacity = args.buffer_capacity;
    source_config.preload_frames = args.preload;

    let tier = detect_capability();
    let quality = args
        .quality
        .map(QualityLevel::from)
        .unwrap_or_else(|| QualityLevel::for_tier(tier));

    let total_frames = metadata.estimated_frames(target_fps, args.start, args.duration);
    let context = StatusContext {
        label: args
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| args.file.display().to_string()),
        total_frames,
        duration: if metadata.duration > 0.0 {
            (metadata.duration - args.start).max(0.0)
        } else {
            0.0
        },
    };

    let clock_options = {
        let mut options = ClockOptions::new(target_fps);
        options.sync_enabled = !args.no_sync;
        options.looping = args.looping;
        options
    };

    let summary = if args.prerender {
        play_prerendered(
            &tools,
            source_config,
            &metadata,
            quality,
            args.dither,
            clock_options,
            !args.no_adaptive,
            args.keep_cache,
            &context,
        )?
    } else {
        play_live(
            &tools,
            source_config,
            &metadata,
            quality,
            args.dither,
            clock_options,
            !args.no_adaptive,
            args.looping,
            tier,
            &context,
        )?
    };

    println!(
        "Played {} frame(s) ({} skipped) at {:.1} FPS{}",
        summary.frames_rendered,
        summary.frames_skipped,
        summary.achieved_fps,
        if summary.stalled { " [stalled]" } else { "" }
    );
    Ok(())
}

fn build_transform(quality: QualityLevel, dither: DitherArg) -> QualityTransform {
    match dither {
        DitherArg::Auto => QualityTransform::new(quality),
        DitherArg::None => QualityTransform::with_dither(quality, DitherMode::None),
        DitherArg::Ordered => QualityTransform::with_dither(quality, DitherMode::Ordered),
        DitherArg::Fs => QualityTransform::with_dither(quality, DitherMode::FloydSteinberg),
    }
}

fn play_live(
    tools: &termvid::tools::DecodeTools,
    source_config: SourceConfig,
    metadata: &VideoMetadata,
    quality: QualityLevel,
    dither: DitherArg,
    clock_options: ClockOptions,
    adaptive: bool,
    looping: bool,
    tier: CapabilityTier,
    context: &StatusContext,
) -> Result<PlaybackSummary> {
    let transform = build_transform(quality, dither);
    let mut last_summary;

    loop {
        let mut source = FrameSource::start(tools, source_config.clone(), metadata)
            .context("failed to start frame extraction")?;

        eprintln!(
            "[termvid] preloading {} frame(s)...",
            source_config.preload_frames
        );
        match source.await_preload() {
            Preload::Complete => {}
            Preload::Partial(count) => {
                eprintln!("[termvid] partial preload: {count} frame(s) ready");
            }
            Preload::Empty => {
                let detail = source
                    .status()
                    .take_error()
                    .unwrap_or_else(|| "no frames were produced".to_owned());
                source.stop();
                anyhow::bail!("playback could not start: {detail}");
            }
        }

        let mut display = TerminalDisplay::enter().context("failed to set up terminal")?;
        let cols = display.cols();
        let rows = display.grid_rows();
        let feed = FrameFeed::Live {
            buffer: source.buffer(),
            status: source.status(),
            transform: &transform,
            cols,
            rows,
        };
        let mut clock = PlaybackClock::new(clock_options, Instant::now());
        let mut perf = PerformanceFeedback::with_tier(clock.target_fps(), tier);
        let mut poll = |timeout: Duration| TerminalDisplay::poll_key(timeout).ok().flatten();
        let summary = run_playback(
            &feed,
            &mut display,
            &mut clock,
            &mut perf,
            adaptive,
            &mut poll,
            context,
        )?;
        let dropped = source.status().frames_dropped();
        source.stop();
        drop(display);
        if dropped > 0 {
            eprintln!("[termvid] producer dropped {dropped} frame(s) against a full buffer");
        }

        last_summary = summary;
        if !(looping && summary.natural_end) {
            break;
        }
    }

    Ok(last_summary)
}

fn play_prerendered(
    tools: &termvid::tools::DecodeTools,
    source_config: SourceConfig,
    metadata: &VideoMetadata,
    quality: QualityLevel,
    dither: DitherArg,
    clock_options: ClockOptions,
    adaptive: bool,
    keep_cache: bool,
    context: &StatusContext,
) -> Result<PlaybackSummary> {
    let guard = MemoryGuard::with_default_thresholds();
    let guard_worker = guard.start().context("failed to start memory sampler")?;

    if context.total_frames > 0 {
        let estimate =
            estimate_prerender_bytes(source_config.width, source_config.height, context.total_frames);
        eprintln!(
            "[termvid] pre-rendering {} frame(s), estimated working memory {}",
            context.total_frames,
            format_bytes(estimate)
        );
    }

    let cols = source_config.width.min(u32::from(u16::MAX)) as u16;
    let rows = (source_config.height / 2).min(u32::from(u16::MAX)) as u16;
    let mut prerender_config = PreRenderConfig::new(
        std::env::temp_dir().join("termvid-cache"),
        cols,
        rows,
        quality,
    );
    prerender_config.dither_override = match dither {
        DitherArg::Auto => None,
        DitherArg::None => Some(DitherMode::None),
        DitherArg::Ordered => Some(DitherMode::Ordered),
        DitherArg::Fs => Some(DitherMode::FloydSteinberg),
    };

    let mut cache = PreRenderCache::start(
        tools,
        source_config,
        metadata,
        prerender_config,
        Some(guard.clone()),
    )
    .context("failed to start pre-render")?;

    while !cache.is_finished() {
        let report = cache.progress();
        eprint!(
            "\r[termvid] pre-rendering: {:3}% ({}/{}) quality={} ETA {}s   ",
            report.percent,
            report.processed,
            report.total,
            report.quality.label(),
            report.eta_secs
        );
        std::thread::sleep(Duration::from_millis(250));
    }
    eprintln!();
    if let Some(error) = cache.take_error() {
        eprintln!(
            "[termvid] pre-render stopped early ({error}); {} frame(s) are available",
            cache.progress().processed
        );
    }

    let summary = {
        let mut display = TerminalDisplay::enter().context("failed to set up terminal")?;
        let feed = FrameFeed::Prerendered { cache: &cache };
        let mut clock = PlaybackClock::new(clock_options, Instant::now());
        let mut perf = PerformanceFeedback::new(clock.target_fps());
        let mut poll = |timeout: Duration| TerminalDisplay::poll_key(timeout).ok().flatten();
        run_playback(
            &feed,
            &mut display,
            &mut clock,
            &mut perf,
            adaptive,
            &mut poll,
            context,
        )?
    };

    guard.stop(guard_worker);
    cache.cancel();
    if keep_cache {
        println!("Pre-render cache kept at {}", cache.session_dir().display());
    } else {
        cache.cleanup();
    }
    Ok(summary)
}

fn run_probe(file: &Path) -> Result<()> {
    let tools = resolve(FfmpegMode::Auto).context("cannot probe without a decoder")?;
    let metadata = probe(&tools, file)?;
    println!(
        "OK: {} ({}x{}, {:.3} fps, {:.2}s, ~{} frames)",
        file.display(),
        metadata.width,
        metadata.height,
        metadata.fps,
        metadata.duration,
        metadata.estimated_frames(metadata.fps, 0.0, None)
    );
    Ok(())
}

fn run_extract(
    file: &Path,
    out: &Path,
    fps: Option<f64>,
    start: f64,
    duration: Option<f64>,
) -> Result<()> {
    let tools = resolve(FfmpegMode::Auto).context("cannot extract without a decoder")?;
    let metadata = probe_or_fallback(&tools, file, fps);
    let target_fps = fps.unwrap_or(if metadata.fps > 0.0 {
        metadata.fps
    } else {
        DEFAULT_FPS
    });

    // Native size; the scale filter is skipped when the probe degraded.
    let mut config = SourceConfig::new(file.to_path_buf(), target_fps, metadata.width, metadata.height);
    config.start_time = start;
    config.duration = duration;

    let total = metadata.estimated_frames(target_fps, start, duration);
    let count = extract_file_sequence(&tools, &config, out, total, &mut |percent| {
        eprint!("\r[termvid] extracting: {percent:3}%   ");
    })?;
    eprintln!();
    println!("Extracted {count} frame(s) to {}", out.display());
    Ok(())
}
