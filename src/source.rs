//! Frame production: the decoder subprocess and its reader worker.
//!
//! Two strategies, selected once at startup and never re-probed:
//! streaming (rawvideo RGB24 on the decoder's stdout) and, when the
//! streaming process cannot be spawned, a file-sequence fallback that has
//! the decoder write numbered JPEGs to a scratch directory first.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::buffer::{FrameBuffer, Preload};
use crate::error::{PlayerError, Result};
use crate::frame::Frame;
use crate::probe::VideoMetadata;
use crate::tools::DecodeTools;

/// How long `put` blocks before the streaming producer drops the frame.
const PUT_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded wait for the producer worker at shutdown.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Target sampling rate the decoder is asked to emit.
    pub fps: f64,
    /// Target pixel width (terminal columns).
    pub width: u32,
    /// Target pixel height (terminal rows * 2).
    pub height: u32,
    pub start_time: f64,
    pub duration: Option<f64>,
    pub buffer_capacity: usize,
    pub preload_frames: usize,
    pub preload_timeout: Duration,
}

impl SourceConfig {
    pub fn new(path: PathBuf, fps: f64, width: u32, height: u32) -> Self {
        Self {
            path,
            fps,
            width,
            height,
            start_time: 0.0,
            duration: None,
            buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
            preload_frames: crate::buffer::DEFAULT_PRELOAD_FRAMES,
            preload_timeout: crate::buffer::DEFAULT_PRELOAD_TIMEOUT,
        }
    }
}

/// Single-writer status fields, read by the UI and the render loop.
#[derive(Debug, Default)]
pub struct SourceStatus {
    complete: AtomicBool,
    produced: AtomicU64,
    dropped: AtomicU64,
    /// Estimated total frames; 0 = unknown (degraded probe).
    total_estimate: AtomicU64,
    /// Percent reported by the fallback extractor's progress stream.
    extraction_percent: AtomicU32,
    error: Mutex<Option<String>>,
}

impl SourceStatus {
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_estimate(&self) -> u64 {
        self.total_estimate.load(Ordering::Relaxed)
    }

    /// Extraction progress in percent. Approximate when the probe was
    /// degraded and no total is known.
    pub fn progress_percent(&self) -> u32 {
        if self.is_complete() {
            return 100;
        }
        let total = self.total_estimate();
        if total > 0 {
            let produced = self.frames_produced();
            return ((produced * 100 / total) as u32).min(99);
        }
        self.extraction_percent.load(Ordering::Relaxed).min(99)
    }

    pub fn take_error(&self) -> Option<String> {
        self.error.lock().expect("status lock poisoned").take()
    }

    /// Mark the production side finished. Called by whatever feeds the
    /// buffer: the decoder worker here, or a caller-supplied producer.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    fn record_error(&self, message: String) {
        *self.error.lock().expect("status lock poisoned") = Some(message);
    }
}

enum Strategy {
    Streaming(Child),
    FileSequence,
}

pub struct FrameSource {
    buffer: Arc<FrameBuffer>,
    status: Arc<SourceStatus>,
    cancel: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    worker: Option<JoinHandle<()>>,
    preload_frames: usize,
    preload_timeout: Duration,
}

impl FrameSource {
    /// Spawn the decoder and its reader worker. The streaming strategy is
    /// attempted first; a spawn failure selects the file-sequence strategy
    /// for the whole session.
    pub fn start(
        tools: &DecodeTools,
        config: SourceConfig,
        metadata: &VideoMetadata,
    ) -> Result<FrameSource> {
        let buffer = Arc::new(FrameBuffer::new(config.buffer_capacity));
        let status = Arc::new(SourceStatus::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let child_slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));

        status.total_estimate.store(
            metadata.estimated_frames(config.fps, config.start_time, config.duration),
            Ordering::Relaxed,
        );

        let strategy = match spawn_streaming(tools, &config) {
            Ok(child) => Strategy::Streaming(child),
            Err(error) => {
                eprintln!(
                    "[termvid] streaming decode unavailable ({error}); \
                     falling back to file-sequence extraction"
                );
                Strategy::FileSequence
            }
        };

        let worker = {
            let buffer = Arc::clone(&buffer);
            let status = Arc::clone(&status);
            let cancel = Arc::clone(&cancel);
            let child_slot = Arc::clone(&child_slot);
            let tools = tools.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("termvid-source".to_owned())
                .spawn(move || {
                    let result = match strategy {
                        Strategy::Streaming(child) => {
                            run_streaming(child, &config, &buffer, &status, &cancel, &child_slot)
                        }
                        Strategy::FileSequence => {
                            run_file_sequence(&tools, &config, &buffer, &status, &cancel, &child_slot)
                        }
                    };
                    if let Err(error) = result {
                        eprintln!("[termvid] frame extraction failed: {error}");
                        status.record_error(error.to_string());
                    }
                    status.mark_complete();
                })
                .map_err(PlayerError::Io)?
        };

        Ok(FrameSource {
            buffer,
            status,
            cancel,
            child: child_slot,
            worker: Some(worker),
            preload_frames: config.preload_frames,
            preload_timeout: config.preload_timeout,
        })
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn status(&self) -> Arc<SourceStatus> {
        Arc::clone(&self.status)
    }

    /// Block until the preload gate opens (see `FrameBuffer::await_preload`).
    pub fn await_preload(&self) -> Preload {
        self.buffer.await_preload(
            self.preload_frames,
            self.preload_timeout,
            &self.status.complete,
        )
    }

    /// True once the producer has finished and the buffer is empty.
    pub fn exhausted(&self) -> bool {
        self.status.is_complete() && self.buffer.is_empty()
    }

    /// Cooperative shutdown: set the cancel flag, terminate the decoder
    /// process, drain the buffer, then join the worker with a bounded wait.
    /// A worker that misses the deadline is reported, never force-killed.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        kill_child(&self.child);
        self.buffer.drain();

        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                self.buffer.drain();
                thread::sleep(JOIN_POLL);
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                eprintln!("[termvid] {}", PlayerError::WorkerStalled("termvid-source"));
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        kill_child(&self.child);
    }
}

fn kill_child(slot: &Arc<Mutex<Option<Child>>>) {
    if let Ok(mut guard) = slot.lock() {
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Arguments for the streaming strategy: constant-frame-rate raw RGB24 on
/// stdout, scaled to the target cell canvas.
pub fn streaming_args(config: &SourceConfig) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-i".to_owned(),
        config.path.to_string_lossy().into_owned(),
    ];
    push_clip_window(&mut args, config);
    args.push("-vf".to_owned());
    args.push(video_filter(config));
    args.push("-vsync".to_owned());
    args.push("cfr".to_owned());
    args.extend([
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgb24".to_owned(),
        "-".to_owned(),
    ]);
    args
}

/// Arguments for the file-sequence fallback: numbered JPEGs in `scratch`.
pub fn file_sequence_args(config: &SourceConfig, scratch: &Path) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        config.path.to_string_lossy().into_owned(),
    ];
    push_clip_window(&mut args, config);
    args.push("-vf".to_owned());
    args.push(video_filter(config));
    args.extend(["-q:v".to_owned(), "2".to_owned()]);
    args.push(
        scratch
            .join("frame_%06d.jpg")
            .to_string_lossy()
            .into_owned(),
    );
    args
}

/// Scale + constant-rate sampling filter; native size when no target
/// dimensions are known (extraction without a probe).
fn video_filter(config: &SourceConfig) -> String {
    if config.width > 0 && config.height > 0 {
        format!("scale={}:{},fps={}", config.width, config.height, config.fps)
    } else {
        format!("fps={}", config.fps)
    }
}

fn push_clip_window(args: &mut Vec<String>, config: &SourceConfig) {
    if config.start_time > 0.0 {
        args.push("-ss".to_owned());
        args.push(config.start_time.to_string());
    }
    if let Some(duration) = config.duration {
        args.push("-t".to_owned());
        args.push(duration.to_string());
    }
}

fn spawn_streaming(tools: &DecodeTools, config: &SourceConfig) -> std::io::Result<Child> {
    Command::new(&tools.ffmpeg)
        .args(streaming_args(config))
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .spawn()
}

enum ReadOutcome {
    Full,
    Eof,
    Partial(usize),
}

fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial(filled)
                });
            }
            Ok(n) => filled += n,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(ReadOutcome::Full)
}

fn run_streaming(
    mut child: Child,
    config: &SourceConfig,
    buffer: &FrameBuffer,
    status: &SourceStatus,
    cancel: &AtomicBool,
    child_slot: &Arc<Mutex<Option<Child>>>,
) -> Result<()> {
    let mut stdout = child.stdout.take().ok_or_else(|| {
        PlayerError::Io(std::io::Error::other("failed to capture decoder stdout"))
    })?;
    *child_slot.lock().expect("child slot poisoned") = Some(child);

    let frame_size = Frame::byte_len(config.width, config.height);
    let mut index: u64 = 0;

    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let mut data = vec![0u8; frame_size];
        match read_frame(&mut stdout, &mut data) {
            Ok(ReadOutcome::Full) => {
                let frame = Frame::new(index, config.width, config.height, data);
                match buffer.put(frame, PUT_TIMEOUT) {
                    Ok(()) => {}
                    Err(PlayerError::BufferFull) => {
                        // Consumer is behind; drop the newest frame and count
                        // the skip rather than overwrite anything buffered.
                        status.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(other) => return Err(other),
                }
                index += 1;
                status.produced.store(index, Ordering::Relaxed);
            }
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Partial(got)) => {
                let corrupt = PlayerError::CorruptFrame {
                    index,
                    expected: frame_size,
                    got,
                };
                eprintln!("[termvid] {corrupt}; end of stream assumed");
                break;
            }
            Err(error) => return Err(PlayerError::Io(error)),
        }
    }

    kill_child(child_slot);
    Ok(())
}

fn run_file_sequence(
    tools: &DecodeTools,
    config: &SourceConfig,
    buffer: &FrameBuffer,
    status: &SourceStatus,
    cancel: &AtomicBool,
    child_slot: &Arc<Mutex<Option<Child>>>,
) -> Result<()> {
    let scratch = scratch_dir();
    fs::create_dir_all(&scratch)?;

    let mut child = Command::new(&tools.ffmpeg)
        .args(file_sequence_args(config, &scratch))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|error| {
            PlayerError::ToolUnavailable(format!(
                "failed to spawn '{}' for file extraction: {error}",
                tools.ffmpeg.display()
            ))
        })?;

    let stderr = child.stderr.take();
    *child_slot.lock().expect("child slot poisoned") = Some(child);

    // The decoder reports per-frame progress on its diagnostic stream; read
    // it here until EOF (the process exiting, or stop() killing it).
    if let Some(mut stderr) = stderr {
        let total = status.total_estimate();
        watch_extraction_progress(&mut stderr, total, cancel, &mut |percent| {
            status.extraction_percent.store(percent, Ordering::Relaxed);
        });
    }

    let exit = {
        let mut guard = child_slot.lock().expect("child slot poisoned");
        match guard.take() {
            Some(mut child) => Some(child.wait()?),
            None => None, // stop() already reaped it
        }
    };

    if cancel.load(Ordering::Acquire) {
        let _ = fs::remove_dir_all(&scratch);
        return Ok(());
    }

    let files = sorted_frame_files(&scratch)?;
    if files.is_empty() {
        let _ = fs::remove_dir_all(&scratch);
        let detail = match exit {
            Some(status) if !status.success() => format!("decoder exited with {status}"),
            _ => "no frames were extracted".to_owned(),
        };
        return Err(PlayerError::Io(std::io::Error::other(detail)));
    }

    status
        .total_estimate
        .store(files.len() as u64, Ordering::Relaxed);

    for path in &files {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(error) => {
                eprintln!(
                    "[termvid] corrupt extracted frame '{}' skipped: {error}",
                    path.display()
                );
                continue;
            }
        };
        let (width, height) = image.dimensions();
        let index = status.frames_produced();
        let frame = Frame::new(index, width, height, image.into_raw());
        // Frames already exist on disk, so wait for space instead of
        // dropping; cancellation is the only way out.
        if !buffer.put_blocking(frame, PUT_TIMEOUT, || cancel.load(Ordering::Acquire)) {
            break;
        }
        status.produced.store(index + 1, Ordering::Relaxed);
    }

    let _ = fs::remove_dir_all(&scratch);
    Ok(())
}

fn watch_extraction_progress(
    stderr: &mut impl Read,
    total_frames: u64,
    cancel: &AtomicBool,
    on_percent: &mut impl FnMut(u32),
) {
    let progress_re = Regex::new(r"frame=\s*(\d+)").expect("static regex");
    let mut acc = String::new();
    let mut chunk = [0u8; 512];
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        match stderr.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                acc.push_str(&String::from_utf8_lossy(&chunk[..n]));
                // Progress lines are terminated with carriage returns.
                while let Some(pos) = acc.find(['\r', '\n']) {
                    let line: String = acc.drain(..=pos).collect();
                    if let Some(percent) = parse_progress_line(&progress_re, &line, total_frames) {
                        on_percent(percent);
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

/// Synchronous file-sequence extraction into `out_dir`, for callers that
/// want the frames rather than playback. Returns the frame count.
pub fn extract_file_sequence(
    tools: &DecodeTools,
    config: &SourceConfig,
    out_dir: &Path,
    total_estimate: u64,
    on_percent: &mut impl FnMut(u32),
) -> Result<u64> {
    fs::create_dir_all(out_dir)?;
    let mut child = Command::new(&tools.ffmpeg)
        .args(file_sequence_args(config, out_dir))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|error| {
            PlayerError::ToolUnavailable(format!(
                "failed to spawn '{}' for extraction: {error}",
                tools.ffmpeg.display()
            ))
        })?;

    if let Some(mut stderr) = child.stderr.take() {
        let never = AtomicBool::new(false);
        watch_extraction_progress(&mut stderr, total_estimate, &never, on_percent);
    }
    let exit = child.wait()?;
    let count = sorted_frame_files(out_dir)?.len() as u64;
    if count == 0 {
        let detail = if exit.success() {
            "no frames were extracted".to_owned()
        } else {
            format!("decoder exited with {exit}")
        };
        return Err(PlayerError::Io(std::io::Error::other(detail)));
    }
    on_percent(100);
    Ok(count)
}

/// Percent complete from a `frame=<n> fps=<f>` diagnostic line, capped at
/// 99 so only real completion reports 100.
fn parse_progress_line(progress_re: &Regex, line: &str, total_frames: u64) -> Option<u32> {
    let captures = progress_re.captures(line)?;
    let frame: u64 = captures[1].parse().ok()?;
    let percent = if total_frames > 0 {
        frame * 100 / total_frames
    } else {
        frame / 5
    };
    Some((percent as u32).min(99))
}

fn sorted_frame_files(scratch: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(scratch)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jpg"))
        .collect();
    files.sort();
    Ok(files)
}

fn scratch_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("termvid-frames-{}-{stamp}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SourceConfig {
        let mut config = SourceConfig::new(PathBuf::from("clip.mp4"), 24.0, 80, 48);
        config.start_time = 2.5;
        config.duration = Some(10.0);
        config
    }

    #[test]
    fn streaming_args_request_cfr_rawvideo() {
        let args = streaming_args(&config());
        let joined = args.join(" ");
        assert!(joined.contains("-i clip.mp4"));
        assert!(joined.contains("-ss 2.5"));
        assert!(joined.contains("-t 10"));
        assert!(joined.contains("scale=80:48,fps=24"));
        assert!(joined.contains("-vsync cfr"));
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -"));
    }

    #[test]
    fn file_sequence_args_use_zero_padded_pattern() {
        let args = file_sequence_args(&config(), Path::new("/tmp/scratch"));
        let joined = args.join(" ");
        assert!(joined.ends_with("/tmp/scratch/frame_%06d.jpg"));
        assert!(joined.contains("-q:v 2"));
    }

    #[test]
    fn unknown_dimensions_drop_the_scale_filter() {
        let config = SourceConfig::new(PathBuf::from("clip.mp4"), 24.0, 0, 0);
        let args = file_sequence_args(&config, Path::new("/tmp/s"));
        assert!(args.iter().any(|a| a == "fps=24"));
        assert!(!args.iter().any(|a| a.contains("scale=")));
    }

    #[test]
    fn default_clip_window_adds_no_seek_flags() {
        let config = SourceConfig::new(PathBuf::from("clip.mp4"), 24.0, 80, 48);
        let args = streaming_args(&config);
        assert!(!args.iter().any(|a| a == "-ss"));
        assert!(!args.iter().any(|a| a == "-t"));
    }

    #[test]
    fn progress_lines_parse_to_capped_percent() {
        let re = Regex::new(r"frame=\s*(\d+)").unwrap();
        assert_eq!(
            parse_progress_line(&re, "frame=  120 fps= 30 q=2.0 size=...", 240),
            Some(50)
        );
        assert_eq!(parse_progress_line(&re, "frame=9999 fps=30", 240), Some(99));
        // unknown total: coarse estimate, still capped
        assert_eq!(parse_progress_line(&re, "frame= 100 fps=30", 0), Some(20));
        assert_eq!(parse_progress_line(&re, "size= 12kB", 240), None);
    }

    #[test]
    fn short_reads_classify_as_partial_or_eof() {
        let mut empty: &[u8] = &[];
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_frame(&mut empty, &mut buf).unwrap(),
            ReadOutcome::Eof
        ));

        let mut partial: &[u8] = &[1, 2];
        assert!(matches!(
            read_frame(&mut partial, &mut buf).unwrap(),
            ReadOutcome::Partial(2)
        ));

        let mut full: &[u8] = &[1, 2, 3, 4, 5];
        assert!(matches!(
            read_frame(&mut full, &mut buf).unwrap(),
            ReadOutcome::Full
        ));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn status_percent_prefers_frame_counts() {
        let status = SourceStatus::default();
        status.total_estimate.store(200, Ordering::Relaxed);
        status.produced.store(50, Ordering::Relaxed);
        assert_eq!(status.progress_percent(), 25);
        status.complete.store(true, Ordering::Release);
        assert_eq!(status.progress_percent(), 100);
    }
}
