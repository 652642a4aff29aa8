//! Full-video pre-rendering: every frame rendered once, ahead of playback,
//! into a bounded on-disk store with an in-memory front cache.
//!
//! One worker, strictly in index order. Memory pressure downgrades quality
//! for subsequent frames but never aborts the run; per-frame cache write
//! failures are logged and skipped.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::buffer::FrameBuffer;
use crate::error::{PlayerError, Result};
use crate::grid::RenderedGrid;
use crate::memory::MemoryGuard;
use crate::probe::VideoMetadata;
use crate::source::{FrameSource, SourceConfig, SourceStatus};
use crate::tools::DecodeTools;
use crate::transform::{FrameTransform, QualityLevel, QualityTransform};

pub const DEFAULT_FRONT_CACHE_CAPACITY: usize = 30;

/// Rolling window used for the time-remaining estimate.
const ETA_WINDOW: usize = 10;
const FETCH_TIMEOUT: Duration = Duration::from_millis(200);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct PreRenderConfig {
    /// Parent directory for per-session render directories.
    pub cache_root: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub quality: QualityLevel,
    /// Pins the dither mode regardless of quality level.
    pub dither_override: Option<crate::quantize::DitherMode>,
    pub front_cache_capacity: usize,
}

impl PreRenderConfig {
    pub fn new(cache_root: PathBuf, cols: u16, rows: u16, quality: QualityLevel) -> Self {
        Self {
            cache_root,
            cols,
            rows,
            quality,
            dither_override: None,
            front_cache_capacity: DEFAULT_FRONT_CACHE_CAPACITY,
        }
    }
}

/// Session metadata sidecar written next to the grid files.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMeta {
    cols: u16,
    rows: u16,
    total_frames: u64,
    quality: String,
}

/// Snapshot of pre-render progress for the UI.
#[derive(Debug, Clone, Copy)]
pub struct PreRenderReport {
    pub processed: u64,
    pub total: u64,
    pub percent: u32,
    pub eta_secs: u32,
    pub quality: QualityLevel,
}

#[derive(Debug)]
struct Shared {
    cancel: AtomicBool,
    finished: AtomicBool,
    processed: AtomicU64,
    total: AtomicU64,
    /// Count of frames written contiguously from index 0.
    contiguous: AtomicU64,
    eta_secs: AtomicU32,
    quality: AtomicU8,
    error: Mutex<Option<String>>,
}

impl Shared {
    fn new(total: u64, quality: QualityLevel) -> Self {
        Self {
            cancel: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(total),
            contiguous: AtomicU64::new(0),
            eta_secs: AtomicU32::new(0),
            quality: AtomicU8::new(quality_to_u8(quality)),
            error: Mutex::new(None),
        }
    }
}

fn quality_to_u8(quality: QualityLevel) -> u8 {
    match quality {
        QualityLevel::Low => 0,
        QualityLevel::Medium => 1,
        QualityLevel::High => 2,
    }
}

fn quality_from_u8(raw: u8) -> QualityLevel {
    match raw {
        0 => QualityLevel::Low,
        1 => QualityLevel::Medium,
        _ => QualityLevel::High,
    }
}

/// FIFO front cache: eviction is strictly insertion order, not recency.
/// Pre-rendered playback reads sequentially, so insertion order and
/// recency coincide and the O(1) VecDeque bookkeeping wins over LRU.
struct FrontCache {
    capacity: usize,
    map: HashMap<u64, RenderedGrid>,
    order: VecDeque<u64>,
}

impl FrontCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, index: u64) -> Option<RenderedGrid> {
        self.map.get(&index).cloned()
    }

    fn insert(&mut self, index: u64, grid: RenderedGrid) {
        if self.map.contains_key(&index) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(index);
        self.map.insert(index, grid);
    }
}

pub struct PreRenderCache {
    shared: Arc<Shared>,
    front: Mutex<FrontCache>,
    session_dir: PathBuf,
    worker: Option<JoinHandle<()>>,
    source: Option<FrameSource>,
}

impl PreRenderCache {
    /// Start a full pre-render of the configured clip: spawns its own
    /// frame source plus the single pre-render worker.
    pub fn start(
        tools: &DecodeTools,
        source_config: SourceConfig,
        metadata: &VideoMetadata,
        config: PreRenderConfig,
        guard: Option<Arc<MemoryGuard>>,
    ) -> Result<Self> {
        let total = metadata.estimated_frames(
            source_config.fps,
            source_config.start_time,
            source_config.duration,
        );
        let source = FrameSource::start(tools, source_config, metadata)?;
        let buffer = source.buffer();
        let status = source.status();
        let mut cache = Self::start_with_feed(buffer, status, total, config, guard)?;
        cache.source = Some(source);
        Ok(cache)
    }

    /// Start the pre-render worker against an existing frame feed. This is
    /// the seam the full `start` builds on.
    pub fn start_with_feed(
        buffer: Arc<FrameBuffer>,
        source_status: Arc<SourceStatus>,
        total_frames: u64,
        config: PreRenderConfig,
        guard: Option<Arc<MemoryGuard>>,
    ) -> Result<Self> {
        let session_dir = config.cache_root.join(format!("render_{}", session_stamp()));
        fs::create_dir_all(&session_dir)?;

        let meta = SessionMeta {
            cols: config.cols,
            rows: config.rows,
            total_frames,
            quality: config.quality.label().to_owned(),
        };
        let meta_path = session_dir.join("session.json");
        fs::write(
            &meta_path,
            serde_json::to_vec_pretty(&meta).expect("session metadata serializes"),
        )?;

        let shared = Arc::new(Shared::new(total_frames, config.quality));
        let front_capacity = config.front_cache_capacity;
        let worker = {
            let shared = Arc::clone(&shared);
            let session_dir = session_dir.clone();
            thread::Builder::new()
                .name("termvid-prerender".to_owned())
                .spawn(move || {
                    run_prerender(&buffer, &source_status, &shared, &session_dir, &config, guard);
                })
                .map_err(PlayerError::Io)?
        };

        Ok(Self {
            shared,
            front: Mutex::new(FrontCache::new(front_capacity)),
            session_dir,
            worker: Some(worker),
            source: None,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn total_frames(&self) -> u64 {
        self.shared.total.load(Ordering::Relaxed)
    }

    /// Completion means every frame was processed; a cancelled or failed
    /// run never reports complete.
    pub fn is_complete(&self) -> bool {
        let total = self.shared.total.load(Ordering::Relaxed);
        total > 0
            && self.shared.processed.load(Ordering::Relaxed) == total
            && !self.shared.cancel.load(Ordering::Relaxed)
    }

    /// True once the worker has exited, complete or not.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Count of frames persisted contiguously from index 0.
    pub fn last_contiguous(&self) -> u64 {
        self.shared.contiguous.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> PreRenderReport {
        let processed = self.shared.processed.load(Ordering::Relaxed);
        let total = self.shared.total.load(Ordering::Relaxed);
        let percent = if total > 0 {
            ((processed * 100) / total).min(100) as u32
        } else {
            0
        };
        PreRenderReport {
            processed,
            total,
            percent,
            eta_secs: self.shared.eta_secs.load(Ordering::Relaxed),
            quality: quality_from_u8(self.shared.quality.load(Ordering::Relaxed)),
        }
    }

    /// Error from a failed run, if any; partial results stay readable.
    pub fn take_error(&self) -> Option<String> {
        self.shared.error.lock().expect("error lock poisoned").take()
    }

    /// Fetch a rendered grid by frame index: front cache first, then the
    /// on-disk store.
    pub fn get(&self, index: u64) -> Option<RenderedGrid> {
        {
            let front = self.front.lock().expect("front cache lock poisoned");
            if let Some(grid) = front.get(index) {
                return Some(grid);
            }
        }
        let path = grid_path(&self.session_dir, index);
        let bytes = fs::read(path).ok()?;
        let grid = RenderedGrid::decode(&bytes).ok()?;
        let mut front = self.front.lock().expect("front cache lock poisoned");
        front.insert(index, grid.clone());
        Some(grid)
    }

    /// Cooperative cancellation: flag, stop the inner source, join the
    /// worker with a bounded wait.
    pub fn cancel(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                eprintln!(
                    "[termvid] {}",
                    PlayerError::WorkerStalled("termvid-prerender")
                );
            }
        }
    }

    /// Remove this session's on-disk store.
    pub fn cleanup(&self) {
        let _ = fs::remove_dir_all(&self.session_dir);
    }
}

impl Drop for PreRenderCache {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_prerender(
    buffer: &FrameBuffer,
    source_status: &SourceStatus,
    shared: &Shared,
    session_dir: &Path,
    config: &PreRenderConfig,
    guard: Option<Arc<MemoryGuard>>,
) {
    let mut quality = config.quality;
    let mut frame_times: VecDeque<f64> = VecDeque::with_capacity(ETA_WINDOW);
    let mut contiguous_intact = true;

    loop {
        if shared.cancel.load(Ordering::Acquire) {
            break;
        }
        let Some(mut frame) = buffer.get(true, FETCH_TIMEOUT) else {
            if source_status.is_complete() && buffer.is_empty() {
                break;
            }
            continue;
        };
        let started = Instant::now();

        if let Some(guard) = &guard {
            // Working copies roughly double the frame footprint.
            let needed = frame.data.len() as u64 * 2;
            if !guard.is_safe(needed) && quality != QualityLevel::Low {
                quality = quality.downgraded();
                shared
                    .quality
                    .store(quality_to_u8(quality), Ordering::Relaxed);
                eprintln!(
                    "[termvid] memory pressure during pre-render; quality downgraded to {}",
                    quality.label()
                );
            }
        }

        let transform = match config.dither_override {
            Some(mode) => QualityTransform::with_dither(quality, mode),
            None => QualityTransform::new(quality),
        };
        transform.apply(&mut frame);
        let grid = RenderedGrid::from_frame(&frame, config.cols, config.rows);
        let path = grid_path(session_dir, frame.index);
        match fs::write(&path, grid.encode()) {
            Ok(()) => {
                if contiguous_intact {
                    shared.contiguous.store(frame.index + 1, Ordering::Relaxed);
                }
            }
            Err(source) => {
                contiguous_intact = false;
                let error = PlayerError::CacheWriteFailed {
                    index: frame.index,
                    source,
                };
                eprintln!("[termvid] {error}; continuing without this entry");
            }
        }

        let processed = shared.processed.fetch_add(1, Ordering::Relaxed) + 1;

        if frame_times.len() == ETA_WINDOW {
            frame_times.pop_front();
        }
        frame_times.push_back(started.elapsed().as_secs_f64());
        let total = shared.total.load(Ordering::Relaxed);
        if total > processed && !frame_times.is_empty() {
            let mean = frame_times.iter().sum::<f64>() / frame_times.len() as f64;
            let eta = mean * (total - processed) as f64;
            shared.eta_secs.store(eta.ceil() as u32, Ordering::Relaxed);
        } else {
            shared.eta_secs.store(0, Ordering::Relaxed);
        }
    }

    // Degraded probe: the real total is only known once the stream ends.
    if !shared.cancel.load(Ordering::Acquire) && shared.total.load(Ordering::Relaxed) == 0 {
        shared
            .total
            .store(shared.processed.load(Ordering::Relaxed), Ordering::Relaxed);
    }
    if let Some(message) = source_status.take_error() {
        *shared.error.lock().expect("error lock poisoned") = Some(message);
    }
    shared.finished.store(true, Ordering::Release);
}

fn grid_path(session_dir: &Path, index: u64) -> PathBuf {
    session_dir.join(format!("frame_{index:06}.grid"))
}

fn session_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Cell;

    fn grid_with_code(code: u8) -> RenderedGrid {
        let frame = crate::frame::Frame::new(
            0,
            1,
            2,
            vec![
                crate::quantize::code_to_rgb(code).0,
                crate::quantize::code_to_rgb(code).1,
                crate::quantize::code_to_rgb(code).2,
                0,
                0,
                0,
            ],
        );
        RenderedGrid::from_frame(&frame, 1, 1)
    }

    #[test]
    fn front_cache_evicts_in_insertion_order() {
        let mut cache = FrontCache::new(3);
        for index in 0..3 {
            cache.insert(index, grid_with_code(196));
        }
        // re-inserting an existing key does not grow or reorder
        cache.insert(1, grid_with_code(21));
        assert_eq!(cache.order.len(), 3);
        cache.insert(3, grid_with_code(46));
        assert!(cache.get(0).is_none(), "oldest entry should be evicted");
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn grid_paths_are_zero_padded_by_index() {
        let dir = Path::new("/cache/render_1");
        assert_eq!(
            grid_path(dir, 42),
            PathBuf::from("/cache/render_1/frame_000042.grid")
        );
        assert_eq!(
            grid_path(dir, 1_000_000),
            PathBuf::from("/cache/render_1/frame_1000000.grid")
        );
    }

    #[test]
    fn reinserted_grid_is_readable() {
        let mut cache = FrontCache::new(2);
        let grid = grid_with_code(244);
        cache.insert(7, grid.clone());
        let fetched = cache.get(7).unwrap();
        assert_eq!(fetched.cell(0, 0), Cell { fg: 244, bg: 16 });
    }
}
