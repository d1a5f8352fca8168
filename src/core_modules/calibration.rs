// THEORY:
// A `CalibrationGrid` is the engine's single output contract to the column
// classifier: how to cut an upright view of the abacus into one strip per rod.
// It is validated once when built and never mutated afterwards; recalibration
// replaces it wholesale.
//
// The grid carries:
// - a region of interest in frame pixels, used when no perspective quad is
//   known (manual calibration of a camera that already looks straight on),
// - an optional four-corner quad; when present the session rectifies that quad
//   and slices the rectified image instead of the region of interest,
// - fractional margins trimmed from each edge before slicing,
// - a column count and the fractional divider positions between columns.

use crate::core_modules::fiducial::MountingMode;
use crate::core_modules::geometry::Quad;
use crate::error::{CalibrationRejection, EngineError, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// How a calibration was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationSource {
    Manual,
    TrackedQuad,
    Fiducial,
}

/// Fractions of the width (left, right) or height (top, bottom) trimmed before slicing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    /// Integer bounding box of a quad, clamped at the origin.
    pub fn bounding(quad: &Quad) -> Self {
        let corners = quad.corners();
        let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min).max(0.0);
        let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min).max(0.0);
        let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max).max(0.0);
        let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max).max(0.0);
        let (x, y) = (min_x.floor() as u32, min_y.floor() as u32);
        Self {
            x,
            y,
            width: (max_x.ceil() as u32).saturating_sub(x),
            height: (max_y.ceil() as u32).saturating_sub(y),
        }
    }

    pub fn as_quad(&self) -> Quad {
        Quad::axis_aligned(
            self.x as f64,
            self.y as f64,
            self.width as f64,
            self.height as f64,
        )
    }
}

/// A column's pixel rectangle inside the sliced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpan {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridParts")]
pub struct CalibrationGrid {
    roi: RegionOfInterest,
    column_count: usize,
    dividers: Vec<f64>,
    margins: Margins,
    quad: Option<Quad>,
    mounting: MountingMode,
    source: CalibrationSource,
}

/// Unvalidated wire form of a grid.
#[derive(Deserialize)]
struct GridParts {
    roi: RegionOfInterest,
    column_count: usize,
    dividers: Vec<f64>,
    #[serde(default)]
    margins: Margins,
    #[serde(default)]
    quad: Option<Quad>,
    #[serde(default)]
    mounting: MountingMode,
    source: CalibrationSource,
}

impl TryFrom<GridParts> for CalibrationGrid {
    type Error = EngineError;

    fn try_from(p: GridParts) -> Result<Self> {
        Self::new(
            p.roi,
            p.column_count,
            p.dividers,
            p.margins,
            p.quad,
            p.mounting,
            p.source,
        )
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    CalibrationRejection::InvalidGrid(reason.into()).into()
}

impl CalibrationGrid {
    pub fn new(
        roi: RegionOfInterest,
        column_count: usize,
        dividers: Vec<f64>,
        margins: Margins,
        quad: Option<Quad>,
        mounting: MountingMode,
        source: CalibrationSource,
    ) -> Result<Self> {
        if quad.is_some_and(|q| q.is_degenerate()) {
            return Err(CalibrationRejection::DegenerateQuad.into());
        }
        if column_count == 0 {
            return Err(invalid("column count must be at least 1"));
        }
        if dividers.len() != column_count - 1 {
            return Err(invalid(format!(
                "{column_count} columns need {} dividers, got {}",
                column_count - 1,
                dividers.len()
            )));
        }
        if dividers.iter().any(|d| !(*d > 0.0 && *d < 1.0)) {
            return Err(invalid("dividers must lie strictly inside (0, 1)"));
        }
        if dividers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("dividers must be strictly increasing"));
        }
        let m = margins;
        if [m.top, m.right, m.bottom, m.left]
            .iter()
            .any(|v| !(*v >= 0.0 && *v < 1.0))
        {
            return Err(invalid("margins must lie in [0, 1)"));
        }
        if m.left + m.right >= 1.0 || m.top + m.bottom >= 1.0 {
            return Err(invalid("opposing margins leave nothing to slice"));
        }
        if roi.width == 0 || roi.height == 0 {
            return Err(invalid("region of interest is empty"));
        }
        Ok(Self {
            roi,
            column_count,
            dividers,
            margins,
            quad,
            mounting,
            source,
        })
    }

    /// Evenly spaced columns over `roi`, no margins, no quad.
    pub fn uniform(roi: RegionOfInterest, column_count: usize, source: CalibrationSource) -> Result<Self> {
        Self::new(
            roi,
            column_count,
            uniform_dividers(column_count),
            Margins::default(),
            None,
            MountingMode::Handheld,
            source,
        )
    }

    /// Evenly spaced columns over a perspective quad.
    pub fn from_quad(
        quad: Quad,
        column_count: usize,
        mounting: MountingMode,
        source: CalibrationSource,
    ) -> Result<Self> {
        Self::new(
            RegionOfInterest::bounding(&quad),
            column_count,
            uniform_dividers(column_count),
            Margins::default(),
            Some(quad),
            mounting,
            source,
        )
    }

    /// Same grid with margins replaced, revalidated.
    pub fn with_margins(self, margins: Margins) -> Result<Self> {
        Self::new(
            self.roi,
            self.column_count,
            self.dividers,
            margins,
            self.quad,
            self.mounting,
            self.source,
        )
    }

    pub fn roi(&self) -> RegionOfInterest {
        self.roi
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn dividers(&self) -> &[f64] {
        &self.dividers
    }

    pub fn margins(&self) -> Margins {
        self.margins
    }

    pub fn quad(&self) -> Option<Quad> {
        self.quad
    }

    pub fn mounting(&self) -> MountingMode {
        self.mounting
    }

    pub fn source(&self) -> CalibrationSource {
        self.source
    }

    /// The area to rectify: the quad if known, otherwise the region of interest.
    pub fn target_quad(&self) -> Quad {
        self.quad.unwrap_or_else(|| self.roi.as_quad())
    }

    /// Column rectangles for an upright image of `width` x `height`.
    pub fn column_spans(&self, width: u32, height: u32) -> Vec<ColumnSpan> {
        let (w, h) = (width as f64, height as f64);
        let x0 = self.margins.left * w;
        let x1 = w - self.margins.right * w;
        let y0 = (self.margins.top * h).round() as u32;
        let y1 = (h - self.margins.bottom * h).round() as u32;

        let edges: Vec<u32> = std::iter::once(0.0)
            .chain(self.dividers.iter().copied())
            .chain(std::iter::once(1.0))
            .map(|f| (x0 + f * (x1 - x0)).round() as u32)
            .collect();
        edges
            .windows(2)
            .map(|e| ColumnSpan {
                x: e[0],
                y: y0,
                width: e[1].saturating_sub(e[0]),
                height: y1.saturating_sub(y0),
            })
            .collect()
    }

    /// Crops one image per column, left to right.
    pub fn slice_columns(&self, image: &RgbaImage) -> Vec<RgbaImage> {
        self.column_spans(image.width(), image.height())
            .into_iter()
            .map(|s| image::imageops::crop_imm(image, s.x, s.y, s.width, s.height).to_image())
            .collect()
    }
}

fn uniform_dividers(column_count: usize) -> Vec<f64> {
    (1..column_count)
        .map(|i| i as f64 / column_count as f64)
        .collect()
}
