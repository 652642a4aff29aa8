//! Error types for termvid.

use std::path::PathBuf;

use thiserror::Error;

/// Playback-engine error taxonomy.
///
/// Only `ToolUnavailable` and setup-time `Io` failures are fatal to the
/// caller; everything else is absorbed close to where it happens with a
/// visible diagnostic.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("decode tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("probe failed for '{path}': {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    #[error("corrupt frame at index {index}: expected {expected} bytes, got {got}")]
    CorruptFrame {
        index: u64,
        expected: usize,
        got: usize,
    },

    #[error("frame buffer full")]
    BufferFull,

    #[error("memory critical: {current} bytes used, critical threshold {critical}")]
    MemoryCritical { current: u64, critical: u64 },

    #[error("cache write failed for frame {index}: {source}")]
    CacheWriteFailed {
        index: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("worker '{0}' did not stop within its join timeout")]
    WorkerStalled(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, PlayerError>;
