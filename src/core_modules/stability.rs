// THEORY:
// The classifier answers every frame, but most of those answers are noise: a
// finger brushing a bead, motion blur, a half-moved rod. The stability filter
// is a debounce. It only surfaces a value once the same confident reading has
// been seen for a run of consecutive frames.
//
// 1.  A reading below the confidence floor is ignored entirely. It neither
//     extends nor breaks the current run.
// 2.  A reading equal to the last raw reading extends the run. Reaching the
//     minimum run length promotes it to the stable value.
// 3.  A different reading starts a new run of one and clears the stable value.
// 4.  Motion between consecutive frames (a hand passing through) clears the
//     stable value, the run and the memory of the last raw reading at once.

use crate::error::{EngineError, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Agreeing confident readings needed before a value is stable.
    pub min_consecutive_frames: u32,
    /// Readings below this confidence are ignored.
    pub min_confidence: f64,
    /// Fraction of sampled pixels that must change to count as motion.
    pub motion_threshold: f64,
    /// Mean absolute RGB difference above which a sampled pixel counts as changed.
    pub pixel_diff_threshold: u8,
    /// Every `sample_stride`-th pixel along each axis is sampled.
    pub sample_stride: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            min_consecutive_frames: 3,
            min_confidence: 0.5,
            motion_threshold: 0.05,
            pixel_diff_threshold: 30,
            sample_stride: 4,
        }
    }
}

impl StabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::InvalidConfig(format!("stability: {msg}")));
        if self.min_consecutive_frames == 0 {
            return fail("min_consecutive_frames must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return fail("min_confidence must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.motion_threshold) {
            return fail("motion_threshold must lie in [0, 1]");
        }
        if self.sample_stride == 0 {
            return fail("sample_stride must be at least 1");
        }
        Ok(())
    }
}

/// What the UI shows every frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StabilityReport {
    pub stable_value: Option<u64>,
    pub is_hand_detected: bool,
    pub current_raw_value: Option<u64>,
    pub current_confidence: f64,
    pub consecutive_frames: u32,
}

/// Fraction of sampled pixels whose mean absolute RGB difference exceeds
/// `pixel_threshold`. Both images must have the same dimensions.
pub fn frame_difference_ratio(
    current: &RgbaImage,
    previous: &RgbaImage,
    pixel_threshold: u8,
    stride: u32,
) -> Result<f64> {
    if current.dimensions() != previous.dimensions() {
        return Err(EngineError::InvalidFrame(format!(
            "cannot diff {:?} against {:?}",
            current.dimensions(),
            previous.dimensions()
        )));
    }
    let stride = stride.max(1);
    let (width, height) = current.dimensions();
    let mut sampled = 0u64;
    let mut changed = 0u64;
    for y in (0..height).step_by(stride as usize) {
        for x in (0..width).step_by(stride as usize) {
            let a = current.get_pixel(x, y).0;
            let b = previous.get_pixel(x, y).0;
            let total: u32 = (0..3).map(|c| a[c].abs_diff(b[c]) as u32).sum();
            sampled += 1;
            if total > pixel_threshold as u32 * 3 {
                changed += 1;
            }
        }
    }
    if sampled == 0 {
        return Ok(0.0);
    }
    Ok(changed as f64 / sampled as f64)
}

#[derive(Debug, Clone)]
pub struct ValueStabilityFilter {
    config: StabilityConfig,
    stable_value: Option<u64>,
    last_raw: Option<u64>,
    last_confidence: f64,
    consecutive: u32,
    hand_detected: bool,
}

impl ValueStabilityFilter {
    pub fn new(config: StabilityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stable_value: None,
            last_raw: None,
            last_confidence: 0.0,
            consecutive: 0,
            hand_detected: false,
        })
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Feeds one classifier reading. Returns the stable value after the update.
    pub fn push_frame(&mut self, value: u64, confidence: f64) -> Option<u64> {
        if confidence.is_nan() || confidence < self.config.min_confidence {
            return self.stable_value;
        }
        self.last_confidence = confidence;

        if self.last_raw == Some(value) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.last_raw = Some(value);
            self.consecutive = 1;
            self.stable_value = None;
        }

        if self.consecutive >= self.config.min_consecutive_frames && self.stable_value != Some(value) {
            debug!(value, frames = self.consecutive, "reading settled");
            self.stable_value = Some(value);
        }
        self.stable_value
    }

    /// Feeds the difference between two consecutive frames. Returns the
    /// changed-pixel ratio.
    pub fn push_frame_diff(&mut self, current: &RgbaImage, previous: &RgbaImage) -> Result<f64> {
        let ratio = frame_difference_ratio(
            current,
            previous,
            self.config.pixel_diff_threshold,
            self.config.sample_stride,
        )?;
        self.hand_detected = ratio > self.config.motion_threshold;
        if self.hand_detected {
            if self.stable_value.is_some() || self.consecutive > 0 {
                debug!(ratio, "motion cleared reading");
            }
            self.stable_value = None;
            self.last_raw = None;
            self.consecutive = 0;
        }
        Ok(ratio)
    }

    pub fn stable_value(&self) -> Option<u64> {
        self.stable_value
    }

    pub fn is_hand_detected(&self) -> bool {
        self.hand_detected
    }

    pub fn reset(&mut self) {
        self.stable_value = None;
        self.last_raw = None;
        self.last_confidence = 0.0;
        self.consecutive = 0;
        self.hand_detected = false;
    }

    pub fn snapshot(&self) -> StabilityReport {
        StabilityReport {
            stable_value: self.stable_value,
            is_hand_detected: self.hand_detected,
            current_raw_value: self.last_raw,
            current_confidence: self.last_confidence,
            consecutive_frames: self.consecutive,
        }
    }
}
