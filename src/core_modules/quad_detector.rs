// THEORY:
// The quad detector is the stateless, single-frame stage of the engine. It
// answers one question per frame: "which four-sided outlines in this image
// could be the abacus frame?" It knows nothing about previous frames; memory is
// the tracker's job.
//
// Pipeline:
// 1.  Grayscale, Gaussian blur, Canny edges, then a small dilation so that the
//     outline of the frame closes into a continuous band.
// 2.  Trace every contour of the edge map and simplify it with a tolerance
//     proportional to its own perimeter. Only four-vertex convex results
//     survive. The proportional tolerance keeps the detector scale-invariant.
// 3.  Filter by area relative to the frame and by aspect ratio against the
//     configured form factors.
// 4.  A closed edge band yields an outer and an inner contour for the same
//     physical outline. Near-identical quads collapse to the larger one.
//
// Finding nothing is the common case (device out of view) and is an empty
// vector, never an error.

use crate::context::EngineContext;
use crate::core_modules::geometry::Quad;
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Absorbs rounding in `ratio - expected` so a band edge is never lost.
const ASPECT_SLACK: f64 = 1e-9;

/// Tunables for single-frame detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Smallest accepted quad area as a fraction of the frame area (inclusive).
    pub min_area_ratio: f64,
    /// Largest accepted quad area as a fraction of the frame area (inclusive).
    pub max_area_ratio: f64,
    /// Maximum absolute difference between a quad's aspect ratio and an expected one.
    pub aspect_ratio_tolerance: f64,
    /// Long side over short side of the accepted form factors.
    pub expected_aspect_ratios: Vec<f64>,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Odd kernel size; 0 or 1 disables blurring.
    pub blur_kernel_size: u32,
    /// Polygon approximation tolerance as a fraction of contour perimeter.
    pub polygon_epsilon_ratio: f64,
    pub dilate_radius: u8,
    /// Quads closer than this fraction of the frame diagonal are duplicates.
    pub duplicate_distance_ratio: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.10,
            max_area_ratio: 0.95,
            aspect_ratio_tolerance: 0.15,
            // US letter and ISO A-series.
            expected_aspect_ratios: vec![1.294, 1.414],
            canny_low: 50.0,
            canny_high: 150.0,
            blur_kernel_size: 5,
            polygon_epsilon_ratio: 0.02,
            dilate_radius: 1,
            duplicate_distance_ratio: 0.02,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::InvalidConfig(format!("detector: {msg}")));
        if !(0.0..=1.0).contains(&self.min_area_ratio)
            || !(0.0..=1.0).contains(&self.max_area_ratio)
            || self.min_area_ratio > self.max_area_ratio
        {
            return fail(format!(
                "area ratios must satisfy 0 <= min ({}) <= max ({}) <= 1",
                self.min_area_ratio, self.max_area_ratio
            ));
        }
        if !(self.aspect_ratio_tolerance >= 0.0) {
            return fail("aspect_ratio_tolerance must be non-negative".into());
        }
        if self.expected_aspect_ratios.is_empty() {
            return fail("expected_aspect_ratios must not be empty".into());
        }
        if let Some(bad) = self
            .expected_aspect_ratios
            .iter()
            .find(|r| !r.is_finite() || **r < 1.0)
        {
            return fail(format!("aspect ratio {bad} must be a finite long/short ratio >= 1"));
        }
        if !(self.canny_low >= 0.0 && self.canny_low <= self.canny_high) {
            return fail("canny thresholds must satisfy 0 <= low <= high".into());
        }
        if self.blur_kernel_size > 1 && self.blur_kernel_size % 2 == 0 {
            return fail(format!("blur kernel size {} must be odd", self.blur_kernel_size));
        }
        if !(self.polygon_epsilon_ratio > 0.0 && self.polygon_epsilon_ratio < 0.5) {
            return fail("polygon_epsilon_ratio must be in (0, 0.5)".into());
        }
        if !(self.duplicate_distance_ratio >= 0.0) {
            return fail("duplicate_distance_ratio must be non-negative".into());
        }
        Ok(())
    }

    /// Inclusive at both edges of every `expected ± tolerance` band.
    pub fn matches_expected_aspect(&self, aspect_ratio: f64) -> bool {
        let tolerance = self.aspect_ratio_tolerance + ASPECT_SLACK;
        self.expected_aspect_ratios
            .iter()
            .any(|expected| (aspect_ratio - expected).abs() <= tolerance)
    }
}

/// Single-frame quadrilateral detector.
#[derive(Debug, Clone)]
pub struct QuadDetector {
    ctx: EngineContext,
    config: DetectorConfig,
}

impl QuadDetector {
    pub fn new(ctx: EngineContext, config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { ctx, config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// All quads in `frame` that pass the filters, largest first.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<Quad>> {
        let backend = self.ctx.backend()?;
        let cfg = &self.config;

        let gray = backend.grayscale(frame.image());
        let blurred = backend.gaussian_blur(&gray, cfg.blur_kernel_size);
        let edges = backend.canny(&blurred, cfg.canny_low, cfg.canny_high);
        let edges = backend.dilate(&edges, cfg.dilate_radius);
        let contours = backend.find_contours(&edges);

        let mut candidates = Vec::new();
        for contour in &contours {
            if contour.points.len() < 4 {
                continue;
            }
            let perimeter = backend.arc_length(&contour.points, true);
            let polygon = backend.approximate_polygon(
                &contour.points,
                cfg.polygon_epsilon_ratio * perimeter,
                true,
            );
            let [a, b, c, d] = polygon[..] else {
                continue;
            };
            let quad = Quad::new([a, b, c, d]);
            if !quad.is_degenerate() {
                candidates.push(quad);
            }
        }

        let quads = filter_candidates(candidates, frame.area(), frame.diagonal(), cfg);
        trace!(
            contours = contours.len(),
            quads = quads.len(),
            "quad detection pass"
        );
        if let Some(largest) = quads.first() {
            debug!(
                area = largest.area(),
                aspect = largest.aspect_ratio(),
                "largest quad"
            );
        }
        Ok(quads)
    }
}

/// Area and aspect filtering, duplicate suppression and largest-first ordering.
pub fn filter_candidates(
    candidates: Vec<Quad>,
    frame_area: f64,
    frame_diagonal: f64,
    config: &DetectorConfig,
) -> Vec<Quad> {
    let min_area = config.min_area_ratio * frame_area;
    let max_area = config.max_area_ratio * frame_area;

    let mut accepted: Vec<Quad> = candidates
        .into_iter()
        .filter(|q| {
            let area = q.area();
            area >= min_area && area <= max_area && config.matches_expected_aspect(q.aspect_ratio())
        })
        .collect();
    accepted.sort_by(|a, b| b.area().total_cmp(&a.area()));

    let duplicate_distance = config.duplicate_distance_ratio * frame_diagonal;
    let mut unique: Vec<Quad> = Vec::with_capacity(accepted.len());
    for quad in accepted {
        if unique
            .iter()
            .all(|kept| kept.average_corner_distance(&quad) >= duplicate_distance)
        {
            unique.push(quad);
        }
    }
    unique
}
