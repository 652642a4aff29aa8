//! 256-color quantization and optional dithering.
//!
//! Colors map into the xterm palette: a 6x6x6 cube (codes 16-231) for
//! chromatic pixels and the 24-step grayscale ramp (codes 232-255, plus the
//! pure black/white cube corners) for achromatic ones.

use crate::frame::Frame;

const CUBE_BASE: u8 = 16;
const GRAY_BASE: u8 = 232;
const GRAY_STEPS: u32 = 23;

/// 4x4 Bayer threshold matrix for ordered dithering.
const BAYER_4X4: [[i16; 4]; 4] = [
    [0, 8, 2, 10],
    [12, 4, 14, 6],
    [3, 11, 1, 9],
    [15, 7, 13, 5],
];

/// Spread applied by the ordered matrix, roughly one cube step.
const ORDERED_SPREAD: i16 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DitherMode {
    None,
    Ordered,
    FloydSteinberg,
}

/// Quantize an RGB triple to an xterm-256 color code.
pub fn ansi256(r: u8, g: u8, b: u8) -> u8 {
    if r == g && g == b {
        if r == 0 {
            return CUBE_BASE; // black cube corner
        }
        if r == 255 {
            return 231; // white cube corner
        }
        let gray = (u32::from(r) * GRAY_STEPS + 127) / 255;
        return GRAY_BASE + gray as u8;
    }
    let level = |c: u8| ((u32::from(c) * 5 + 127) / 255) as u8;
    CUBE_BASE + level(r) * 36 + level(g) * 6 + level(b)
}

/// Representative RGB for a 256-color code: the uniform-grid inverse of
/// `ansi256`, so representatives requantize to the code that produced
/// them. Used to compute quantization error during dithering. Codes below
/// 16 (the legacy block) are never produced by `ansi256` and map to black.
pub fn code_to_rgb(code: u8) -> (u8, u8, u8) {
    if code >= GRAY_BASE {
        let step = u32::from(code - GRAY_BASE);
        let v = ((step * 255 + GRAY_STEPS / 2) / GRAY_STEPS) as u8;
        return (v, v, v);
    }
    if code >= CUBE_BASE {
        let index = code - CUBE_BASE;
        // 255/5 divides evenly; each cube level is 51 apart.
        let r = (index / 36) * 51;
        let g = ((index / 6) % 6) * 51;
        let b = (index % 6) * 51;
        return (r, g, b);
    }
    (0, 0, 0)
}

/// Dither a frame's pixel data in place so that subsequent quantization
/// shows less banding. A no-op for `DitherMode::None`.
pub fn dither(frame: &mut Frame, mode: DitherMode) {
    match mode {
        DitherMode::None => {}
        DitherMode::Ordered => ordered_dither(frame),
        DitherMode::FloydSteinberg => floyd_steinberg(frame),
    }
}

fn ordered_dither(frame: &mut Frame) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    for y in 0..height {
        for x in 0..width {
            let offset = (y * width + x) * 3;
            let threshold = BAYER_4X4[y % 4][x % 4];
            let bias = ((threshold * 2 + 1) * ORDERED_SPREAD / 32) - (ORDERED_SPREAD / 2);
            for channel in 0..3 {
                let value = i16::from(frame.data[offset + channel]) + bias;
                frame.data[offset + channel] = value.clamp(0, 255) as u8;
            }
        }
    }
}

fn floyd_steinberg(frame: &mut Frame) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    // i16 working copy; diffusion pushes channels outside u8 range.
    let mut work: Vec<i16> = frame.data.iter().map(|&b| i16::from(b)).collect();

    for y in 0..height {
        for x in 0..width {
            let offset = (y * width + x) * 3;
            let old = [
                work[offset].clamp(0, 255) as u8,
                work[offset + 1].clamp(0, 255) as u8,
                work[offset + 2].clamp(0, 255) as u8,
            ];
            let code = ansi256(old[0], old[1], old[2]);
            let new = code_to_rgb(code);
            let new = [new.0, new.1, new.2];
            for channel in 0..3 {
                work[offset + channel] = i16::from(new[channel]);
                frame.data[offset + channel] = new[channel];
            }

            let err = [
                i16::from(old[0]) - i16::from(new[0]),
                i16::from(old[1]) - i16::from(new[1]),
                i16::from(old[2]) - i16::from(new[2]),
            ];
            let mut spread = |dx: isize, dy: isize, weight: i16| {
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                if nx < 0 || nx >= width as isize || ny >= height as isize {
                    return;
                }
                let target = (ny as usize * width + nx as usize) * 3;
                for channel in 0..3 {
                    work[target + channel] += err[channel] * weight / 16;
                }
            };
            spread(1, 0, 7);
            spread(-1, 1, 3);
            spread(0, 1, 5);
            spread(1, 1, 1);
        }
    }
}
