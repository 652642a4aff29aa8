//! Process resident-memory sampling.
//!
//! A dedicated sampler thread refreshes the reading on a fixed interval;
//! callers only ever read the last sampled value and are never blocked by
//! the platform query.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::PlayerError;

pub const DEFAULT_WARNING_MB: u64 = 500;
pub const DEFAULT_CRITICAL_MB: u64 = 800;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(25);

/// Overhead factor applied to raw pixel-buffer math when estimating the
/// memory a full pre-render pass will need.
const ESTIMATE_OVERHEAD_NUM: u64 = 13;
const ESTIMATE_OVERHEAD_DEN: u64 = 10;

/// Snapshot of the guard's view of process memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStatus {
    pub current_usage: u64,
    pub peak_usage: u64,
    pub warning_threshold: u64,
    pub critical_threshold: u64,
    pub is_safe: bool,
    pub is_warning: bool,
    pub is_critical: bool,
}

pub struct MemoryGuard {
    current: AtomicU64,
    peak: AtomicU64,
    warning_threshold: u64,
    critical_threshold: u64,
    cancel: AtomicBool,
}

impl MemoryGuard {
    pub fn new(warning_threshold: u64, critical_threshold: u64) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            warning_threshold,
            critical_threshold,
            cancel: AtomicBool::new(false),
        })
    }

    pub fn with_default_thresholds() -> Arc<Self> {
        Self::new(
            DEFAULT_WARNING_MB * 1024 * 1024,
            DEFAULT_CRITICAL_MB * 1024 * 1024,
        )
    }

    /// Spawn the sampler worker. Returns the handle to pass to `stop`.
    pub fn start(self: &Arc<Self>) -> crate::error::Result<JoinHandle<()>> {
        let guard = Arc::clone(self);
        thread::Builder::new()
            .name("termvid-memory".to_owned())
            .spawn(move || {
                let mut was_critical = false;
                while !guard.cancel.load(Ordering::Acquire) {
                    let usage = guard.sample();
                    let critical = usage >= guard.critical_threshold;
                    if critical && !was_critical {
                        eprintln!(
                            "[termvid] memory usage critical: {}",
                            format_bytes(usage)
                        );
                    }
                    was_critical = critical;
                    thread::sleep(SAMPLE_INTERVAL);
                }
            })
            .map_err(PlayerError::Io)
    }

    /// Stop the sampler with a bounded join.
    pub fn stop(self: &Arc<Self>, worker: JoinHandle<()>) {
        self.cancel.store(true, Ordering::Release);
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            eprintln!("[termvid] {}", PlayerError::WorkerStalled("termvid-memory"));
        }
    }

    /// Take a fresh resident-memory reading and publish it.
    pub fn sample(&self) -> u64 {
        let usage = resident_memory();
        self.current.store(usage, Ordering::Relaxed);
        self.peak.fetch_max(usage, Ordering::Relaxed);
        usage
    }

    /// Last sampled usage in bytes; never queries the platform.
    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// True iff the last sampled usage plus `additional_bytes` stays below
    /// the critical threshold.
    pub fn is_safe(&self, additional_bytes: u64) -> bool {
        self.current_usage().saturating_add(additional_bytes) < self.critical_threshold
    }

    pub fn status(&self) -> MemoryStatus {
        let current = self.current_usage();
        MemoryStatus {
            current_usage: current,
            peak_usage: self.peak.load(Ordering::Relaxed),
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            is_safe: current < self.warning_threshold,
            is_warning: current >= self.warning_threshold && current < self.critical_threshold,
            is_critical: current >= self.critical_threshold,
        }
    }

    #[cfg(test)]
    fn inject_usage(&self, bytes: u64) {
        self.current.store(bytes, Ordering::Relaxed);
        self.peak.fetch_max(bytes, Ordering::Relaxed);
    }
}

/// Estimated bytes needed to hold `frames` decoded RGB frames, with the
/// bookkeeping overhead factor applied.
pub fn estimate_prerender_bytes(width: u32, height: u32, frames: u64) -> u64 {
    let frame_bytes = u64::from(width) * u64::from(height) * 3;
    frame_bytes * frames * ESTIMATE_OVERHEAD_NUM / ESTIMATE_OVERHEAD_DEN
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Best-effort resident set size in bytes; 0 when unavailable.
#[cfg(target_os = "linux")]
fn resident_memory() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next() {
                return kb.parse::<u64>().map(|kb| kb * 1024).unwrap_or(0);
            }
        }
    }
    0
}

#[cfg(target_os = "macos")]
fn resident_memory() -> u64 {
    let output = std::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &std::process::id().to_string()])
        .output();
    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u64>()
            .map(|kb| kb * 1024)
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn resident_memory() -> u64 {
    0
}
