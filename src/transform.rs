//! Frame transforms applied between decode and quantization.

use crate::frame::Frame;
use crate::quantize::{dither, DitherMode};

/// A processing step applied to a decoded frame before it is quantized.
/// The explicit seam lets the pre-render worker and the live path share
/// pipelines without inspecting each other.
pub trait FrameTransform: Send {
    fn apply(&self, frame: &mut Frame);
}

/// Rendering quality, mapped from the host capability tier and downgraded
/// at runtime when memory pressure demands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub fn for_tier(tier: crate::perf::CapabilityTier) -> Self {
        match tier {
            crate::perf::CapabilityTier::Low => QualityLevel::Low,
            crate::perf::CapabilityTier::Medium => QualityLevel::Medium,
            crate::perf::CapabilityTier::High => QualityLevel::High,
        }
    }

    /// One step down; Low stays Low.
    pub fn downgraded(self) -> Self {
        match self {
            QualityLevel::High => QualityLevel::Medium,
            QualityLevel::Medium | QualityLevel::Low => QualityLevel::Low,
        }
    }

    pub fn dither_mode(self) -> DitherMode {
        match self {
            QualityLevel::High => DitherMode::FloydSteinberg,
            QualityLevel::Medium => DitherMode::Ordered,
            QualityLevel::Low => DitherMode::None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityLevel::High => "high",
            QualityLevel::Medium => "medium",
            QualityLevel::Low => "low",
        }
    }
}

/// Quality-driven transform: mild color boost at the high level, then the
/// level's dithering pass.
#[derive(Debug, Clone, Copy)]
pub struct QualityTransform {
    level: QualityLevel,
    dither_override: Option<DitherMode>,
}

impl QualityTransform {
    pub fn new(level: QualityLevel) -> Self {
        Self {
            level,
            dither_override: None,
        }
    }

    /// Pin the dither mode regardless of quality level (`--dither` flag).
    pub fn with_dither(level: QualityLevel, mode: DitherMode) -> Self {
        Self {
            level,
            dither_override: Some(mode),
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn set_level(&mut self, level: QualityLevel) {
        self.level = level;
    }

    fn effective_dither(&self) -> DitherMode {
        self.dither_override.unwrap_or_else(|| self.level.dither_mode())
    }
}

impl FrameTransform for QualityTransform {
    fn apply(&self, frame: &mut Frame) {
        if self.level == QualityLevel::High {
            boost_contrast(frame);
        }
        dither(frame, self.effective_dither());
    }
}

/// Identity transform for callers that want the raw decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransform;

impl FrameTransform for NoTransform {
    fn apply(&self, _frame: &mut Frame) {}
}

/// Mild contrast expansion around mid-gray (factor 1.1), saturating.
fn boost_contrast(frame: &mut Frame) {
    for channel in frame.data.iter_mut() {
        let centered = i32::from(*channel) - 128;
        *channel = (centered * 11 / 10 + 128).clamp(0, 255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_bottoms_out_at_low() {
        assert_eq!(QualityLevel::High.downgraded(), QualityLevel::Medium);
        assert_eq!(QualityLevel::Medium.downgraded(), QualityLevel::Low);
        assert_eq!(QualityLevel::Low.downgraded(), QualityLevel::Low);
    }

    #[test]
    fn low_quality_leaves_pixels_untouched() {
        let data = vec![7u8; Frame::byte_len(3, 2)];
        let mut frame = Frame::new(0, 3, 2, data.clone());
        QualityTransform::new(QualityLevel::Low).apply(&mut frame);
        assert_eq!(frame.data, data);
    }

    #[test]
    fn contrast_boost_expands_away_from_midgray() {
        let mut frame = Frame::new(0, 1, 1, vec![200, 128, 60]);
        boost_contrast(&mut frame);
        assert!(frame.data[0] > 200);
        assert_eq!(frame.data[1], 128);
        assert!(frame.data[2] < 60);
    }

    #[test]
    fn dither_override_wins_over_level_default() {
        let transform = QualityTransform::with_dither(QualityLevel::High, DitherMode::None);
        assert_eq!(transform.effective_dither(), DitherMode::None);
        let transform = QualityTransform::new(QualityLevel::High);
        assert_eq!(transform.effective_dither(), DitherMode::FloydSteinberg);
    }
}
