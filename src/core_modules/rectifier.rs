// THEORY:
// The rectifier turns a quadrilateral seen in perspective into an upright
// rectangle the column slicer can cut with straight vertical lines.
//
// 1.  Output size comes from the quad itself: width is the rounded mean of the
//     top and bottom sides, height the rounded mean of the left and right sides.
//     No resampling to a fixed size happens here.
// 2.  The four image corners map to the four output corners. For a
//     desk-mounted camera the correspondence is diagonally swapped, so the
//     output comes out upright without a separate rotation pass.
// 3.  A homography that cannot be fit (near-collinear corners) or a warp that
//     fails is a `TransformFailed`, which callers treat as "no output this
//     frame". An uninitialized backend is `NotReady`, never a blank image.

use crate::context::EngineContext;
use crate::core_modules::fiducial::MountingMode;
use crate::core_modules::geometry::{Point, Quad};
use crate::core_modules::imaging::{Homography, Interpolation, QuarterTurn, WarpOptions};
use crate::error::{EngineError, Result};
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifierConfig {
    pub interpolation: Interpolation,
    /// RGBA written where the source has no pixels.
    pub border: [u8; 4],
    /// Extra clockwise rotation applied after the warp, e.g. for an abacus
    /// whose rods run horizontally in the camera view.
    pub output_turn: QuarterTurn,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Bilinear,
            border: [0, 0, 0, 255],
            output_turn: QuarterTurn::None,
        }
    }
}

/// An upright view of a quad.
#[derive(Debug, Clone)]
pub struct RectifiedImage {
    pub image: RgbaImage,
    /// Frame coordinates to output coordinates (before `output_turn`).
    pub homography: Homography,
    pub source: Quad,
}

/// Rounded mean of opposing side lengths: `(width, height)`.
pub fn output_size(quad: &Quad) -> (u32, u32) {
    (quad.width().round() as u32, quad.height().round() as u32)
}

/// Output rectangle corners matched to the quad's TL, TR, BR, BL.
pub fn destination_corners(width: u32, height: u32, mounting: MountingMode) -> [Point; 4] {
    let (w, h) = (width as f64, height as f64);
    let upright = [
        Point::new(0.0, 0.0),
        Point::new(w, 0.0),
        Point::new(w, h),
        Point::new(0.0, h),
    ];
    match mounting {
        MountingMode::Handheld => upright,
        MountingMode::DeskMounted => [upright[2], upright[3], upright[0], upright[1]],
    }
}

#[derive(Debug, Clone)]
pub struct PerspectiveRectifier {
    ctx: EngineContext,
    config: RectifierConfig,
}

impl PerspectiveRectifier {
    pub fn new(ctx: EngineContext, config: RectifierConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &RectifierConfig {
        &self.config
    }

    pub fn rectify(&self, frame: &RgbaImage, quad: &Quad, mounting: MountingMode) -> Result<RectifiedImage> {
        let backend = self.ctx.backend()?;
        let (width, height) = output_size(quad);
        if width == 0 || height == 0 {
            return Err(EngineError::TransformFailed(format!(
                "quad collapses to {width}x{height}"
            )));
        }

        let destination = destination_corners(width, height, mounting);
        let homography = backend
            .find_homography(&quad.corners(), &destination)
            .ok_or_else(|| EngineError::TransformFailed("corners are near-collinear".into()))?;

        let options = WarpOptions {
            interpolation: self.config.interpolation,
            border: Rgba(self.config.border),
        };
        let warped = backend
            .warp_perspective(frame, &homography, width, height, &options)
            .ok_or_else(|| EngineError::TransformFailed("homography is not invertible".into()))?;
        let image = match self.config.output_turn {
            QuarterTurn::None => warped,
            turn => backend.rotate(&warped, turn),
        };

        trace!(width = image.width(), height = image.height(), ?mounting, "rectified");
        Ok(RectifiedImage {
            image,
            homography,
            source: *quad,
        })
    }
}
