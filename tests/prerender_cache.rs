//! Pre-render cache lifecycle against a temporary on-disk store.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use termvid::buffer::FrameBuffer;
use termvid::frame::Frame;
use termvid::prerender::{PreRenderCache, PreRenderConfig};
use termvid::source::SourceStatus;
use termvid::transform::QualityLevel;

const COLS: u16 = 6;
const ROWS: u16 = 3;

fn synthetic_frame(index: u64) -> Frame {
    let width = u32::from(COLS);
    let height = u32::from(ROWS) * 2;
    let shade = ((index * 37) % 256) as u8;
    Frame::new(
        index,
        width,
        height,
        vec![shade; Frame::byte_len(width, height)],
    )
}

fn cache_config(root: &std::path::Path) -> PreRenderConfig {
    PreRenderConfig::new(root.to_path_buf(), COLS, ROWS, QualityLevel::Low)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn full_run_persists_every_frame_in_order() {
    let root = tempfile::tempdir().expect("temp cache root");
    let buffer = Arc::new(FrameBuffer::new(8));
    let status = Arc::new(SourceStatus::default());
    let total = 12u64;

    let cache = PreRenderCache::start_with_feed(
        Arc::clone(&buffer),
        Arc::clone(&status),
        total,
        cache_config(root.path()),
        None,
    )
    .expect("pre-render should start");

    for index in 0..total {
        let ok = buffer.put_blocking(synthetic_frame(index), Duration::from_millis(50), || false);
        assert!(ok);
    }
    status.mark_complete();

    assert!(
        wait_until(Duration::from_secs(5), || cache.is_finished()),
        "worker should finish"
    );
    assert!(cache.is_complete());
    assert_eq!(cache.last_contiguous(), total);
    assert_eq!(cache.progress().percent, 100);
    assert!(cache.take_error().is_none());

    // zero-padded per-index files plus the session sidecar
    assert!(cache.session_dir().join("frame_000000.grid").exists());
    assert!(cache.session_dir().join("frame_000011.grid").exists());
    assert!(cache.session_dir().join("session.json").exists());

    // every index resolves, through the front cache or from disk
    for index in 0..total {
        let grid = cache.get(index).expect("grid should exist");
        assert_eq!(grid.cols(), COLS);
        assert_eq!(grid.rows(), ROWS);
    }
    assert!(cache.get(total).is_none());

    cache.cleanup();
    assert!(!cache.session_dir().exists());
}

#[test]
fn cancel_stops_an_unfinished_run() {
    let root = tempfile::tempdir().expect("temp cache root");
    let buffer = Arc::new(FrameBuffer::new(4));
    let status = Arc::new(SourceStatus::default());

    let mut cache = PreRenderCache::start_with_feed(
        Arc::clone(&buffer),
        Arc::clone(&status),
        100,
        cache_config(root.path()),
        None,
    )
    .expect("pre-render should start");

    // a few frames trickle in; the producer never completes
    for index in 0..3 {
        let ok = buffer.put_blocking(synthetic_frame(index), Duration::from_millis(50), || false);
        assert!(ok);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        cache.progress().processed == 3
    }));

    let cancelled_at = Instant::now();
    cache.cancel();
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(3),
        "cancel joins within the bounded timeout"
    );
    assert!(cache.is_finished());
    assert!(!cache.is_complete());

    // partial results remain readable
    assert!(cache.get(0).is_some());
    assert_eq!(cache.progress().processed, 3);
}

#[test]
fn degraded_probe_learns_the_total_at_end_of_stream() {
    let root = tempfile::tempdir().expect("temp cache root");
    let buffer = Arc::new(FrameBuffer::new(4));
    let status = Arc::new(SourceStatus::default());

    // total unknown up front (degraded probe)
    let cache = PreRenderCache::start_with_feed(
        Arc::clone(&buffer),
        Arc::clone(&status),
        0,
        cache_config(root.path()),
        None,
    )
    .expect("pre-render should start");

    for index in 0..7 {
        let ok = buffer.put_blocking(synthetic_frame(index), Duration::from_millis(50), || false);
        assert!(ok);
    }
    status.mark_complete();

    assert!(wait_until(Duration::from_secs(5), || cache.is_finished()));
    assert_eq!(cache.total_frames(), 7);
    assert!(cache.is_complete());
}
