//! termvid: ffmpeg-fed half-block video playback for 256-color terminals.
//!
//! The decoder runs as an external process; this crate owns everything after
//! the pipe: the bounded frame buffer, the playback clock with drift
//! correction and catch-up skipping, the optional full-video pre-render
//! cache, and the pixel-pair to color-cell mapping.

pub mod buffer;
pub mod clock;
pub mod display;
pub mod error;
pub mod frame;
pub mod grid;
pub mod memory;
pub mod perf;
pub mod play;
pub mod prerender;
pub mod probe;
pub mod quantize;
pub mod source;
pub mod tools;
pub mod transform;
