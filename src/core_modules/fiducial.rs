// THEORY:
// The fiducial calibrator is the alternative to waiting for a tracker lock. Four
// printed markers sit at the physical corners of the abacus, each with a
// reserved id. One frame that shows all four is enough to calibrate.
//
// 1.  Every frame is judged on its own. Three markers out of four is a
//     rejection naming the missing ids, not a partial calibration.
// 2.  Each marker contributes its inner corner: the marker corner nearest the
//     center of the four marker centers. That is the corner touching the
//     device's working area, whatever the marker's printed orientation.
// 3.  The camera mounting decides where each reserved marker must appear in
//     the image. A handheld camera sees the device upright; a desk-mounted
//     camera looking down from the far side sees it turned by 180 degrees. The
//     expectation is a fixed table per mounting mode. If the observed layout
//     disagrees with the table, the candidate is rejected.

use crate::context::EngineContext;
use crate::core_modules::geometry::{self, Point, Quad};
use crate::core_modules::markers::{FiducialMarker, MarkerDetector, SquareMarkerDetector};
use crate::error::{CalibrationRejection, EngineError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Where the camera sits relative to the abacus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MountingMode {
    /// Held in front of the device; the image shows it upright.
    #[default]
    Handheld,
    /// Looking down from across the desk; the image shows it turned 180 degrees.
    DeskMounted,
}

impl MountingMode {
    /// For each device corner (TL, TR, BR, BL), the image corner index where it appears.
    pub fn image_slots(self) -> [usize; 4] {
        match self {
            MountingMode::Handheld => [0, 1, 2, 3],
            MountingMode::DeskMounted => [2, 3, 0, 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiducialConfig {
    /// Reserved marker ids for the device's TL, TR, BR and BL corners.
    pub corner_ids: [u32; 4],
    pub mounting: MountingMode,
}

impl Default for FiducialConfig {
    fn default() -> Self {
        Self {
            corner_ids: [0, 1, 2, 3],
            mounting: MountingMode::Handheld,
        }
    }
}

impl FiducialConfig {
    pub fn validate(&self) -> Result<()> {
        let ids = self.corner_ids;
        for i in 0..4 {
            if ids[i + 1..].contains(&ids[i]) {
                return Err(EngineError::InvalidConfig(format!(
                    "fiducial: corner id {} is reserved twice",
                    ids[i]
                )));
            }
        }
        Ok(())
    }
}

/// A successful four-marker calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct FiducialCalibration {
    /// Inner corners in image order.
    pub quad: Quad,
    /// The reserved markers in device order (TL, TR, BR, BL).
    pub markers: [FiducialMarker; 4],
    pub mounting: MountingMode,
}

impl FiducialCalibration {
    /// Inner corners in device order (TL, TR, BR, BL).
    pub fn device_corners(&self) -> [Point; 4] {
        let corners = self.quad.corners();
        self.mounting.image_slots().map(|slot| corners[slot])
    }
}

pub struct FiducialCalibrator {
    ctx: EngineContext,
    detector: Box<dyn MarkerDetector>,
    config: FiducialConfig,
}

impl FiducialCalibrator {
    pub fn new(ctx: EngineContext, config: FiducialConfig) -> Result<Self> {
        Self::with_detector(ctx, Box::new(SquareMarkerDetector::default()), config)
    }

    pub fn with_detector(
        ctx: EngineContext,
        detector: Box<dyn MarkerDetector>,
        config: FiducialConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx,
            detector,
            config,
        })
    }

    pub fn config(&self) -> &FiducialConfig {
        &self.config
    }

    /// Detects markers in `frame` and calibrates from them.
    pub fn calibrate(&self, frame: &Frame) -> Result<FiducialCalibration> {
        let backend = self.ctx.backend()?;
        let gray = backend.grayscale(frame.image());
        let markers = self.detector.detect(&gray);
        trace!(markers = markers.len(), "fiducial scan");
        self.calibrate_from_markers(&markers)
    }

    /// Calibrates from markers already found in one frame.
    pub fn calibrate_from_markers(&self, markers: &[FiducialMarker]) -> Result<FiducialCalibration> {
        let mut reserved: [Option<FiducialMarker>; 4] = [None; 4];
        for marker in markers {
            let Some(role) = self.config.corner_ids.iter().position(|id| *id == marker.id) else {
                continue;
            };
            // Duplicate sightings of one id keep the largest.
            match reserved[role] {
                Some(seen) if seen.area() >= marker.area() => {}
                _ => reserved[role] = Some(*marker),
            }
        }

        let missing: Vec<u32> = (0..4)
            .filter(|&role| reserved[role].is_none())
            .map(|role| self.config.corner_ids[role])
            .collect();
        let [Some(tl), Some(tr), Some(br), Some(bl)] = reserved else {
            debug!(?missing, "fiducial calibration incomplete");
            return Err(CalibrationRejection::MissingMarkers { missing }.into());
        };
        let by_role = [tl, tr, br, bl];

        let centers = by_role.map(|m| m.center);
        let middle = geometry::centroid(&centers);
        let inner = by_role.map(|m| m.nearest_corner(middle));

        let quad = Quad::new(inner);
        if quad.is_degenerate() {
            return Err(CalibrationRejection::DegenerateQuad.into());
        }
        let image_corners = quad.corners();
        let slots = self.config.mounting.image_slots();
        if (0..4).any(|role| image_corners[slots[role]] != inner[role]) {
            debug!(mounting = ?self.config.mounting, "marker layout disagrees with mounting");
            return Err(CalibrationRejection::LayoutMismatch.into());
        }

        debug!(area = quad.area(), mounting = ?self.config.mounting, "fiducial calibration accepted");
        Ok(FiducialCalibration {
            quad,
            markers: by_role,
            mounting: self.config.mounting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::markers::draw_marker;
    use image::imageops::overlay;
    use image::{DynamicImage, GrayImage, Luma};

    fn marker(id: u32, x: f64, y: f64, size: f64) -> FiducialMarker {
        let corners = [
            Point::new(x, y),
            Point::new(x + size, y),
            Point::new(x + size, y + size),
            Point::new(x, y + size),
        ];
        FiducialMarker {
            id,
            corners,
            center: geometry::centroid(&corners),
            rotation: 0,
        }
    }

    /// Markers `ids` placed at the image TL, TR, BR, BL of a 400x300 frame.
    fn layout(ids: [u32; 4]) -> Vec<FiducialMarker> {
        vec![
            marker(ids[0], 20.0, 20.0, 40.0),
            marker(ids[1], 340.0, 20.0, 40.0),
            marker(ids[2], 340.0, 240.0, 40.0),
            marker(ids[3], 20.0, 240.0, 40.0),
        ]
    }

    fn calibrator(mounting: MountingMode) -> FiducialCalibrator {
        let config = FiducialConfig {
            mounting,
            ..FiducialConfig::default()
        };
        FiducialCalibrator::new(EngineContext::imageproc(), config).unwrap()
    }

    #[test]
    fn four_markers_give_inner_quad() {
        let cal = calibrator(MountingMode::Handheld)
            .calibrate_from_markers(&layout([0, 1, 2, 3]))
            .unwrap();
        assert_eq!(
            cal.quad.corners(),
            [
                Point::new(60.0, 60.0),
                Point::new(340.0, 60.0),
                Point::new(340.0, 240.0),
                Point::new(60.0, 240.0)
            ]
        );
        assert_eq!(cal.device_corners(), cal.quad.corners());
    }

    #[test]
    fn three_markers_are_a_failure() {
        let mut markers = layout([0, 1, 2, 3]);
        markers.remove(2);
        let err = calibrator(MountingMode::Handheld)
            .calibrate_from_markers(&markers)
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidCalibration(CalibrationRejection::MissingMarkers { missing: vec![2] })
        );
    }

    #[test]
    fn desk_mount_expects_rotated_layout() {
        // Seen from across the desk, the device TL marker (id 0) is at the image BR.
        let rotated = layout([2, 3, 0, 1]);
        let cal = calibrator(MountingMode::DeskMounted)
            .calibrate_from_markers(&rotated)
            .unwrap();
        assert_eq!(cal.device_corners()[0], Point::new(340.0, 240.0));
        assert_eq!(cal.markers[0].id, 0);

        let err = calibrator(MountingMode::Handheld)
            .calibrate_from_markers(&rotated)
            .unwrap_err();
        assert_eq!(err, EngineError::from(CalibrationRejection::LayoutMismatch));
    }

    #[test]
    fn foreign_and_duplicate_markers_are_ignored() {
        let mut markers = layout([0, 1, 2, 3]);
        markers.push(marker(9, 180.0, 140.0, 40.0));
        markers.push(marker(0, 150.0, 100.0, 10.0));
        let cal = calibrator(MountingMode::Handheld)
            .calibrate_from_markers(&markers)
            .unwrap();
        assert_eq!(cal.markers[0].corners[0], Point::new(20.0, 20.0));
    }

    #[test]
    fn rejects_reused_ids() {
        let config = FiducialConfig {
            corner_ids: [4, 5, 4, 6],
            ..FiducialConfig::default()
        };
        assert!(FiducialCalibrator::new(EngineContext::imageproc(), config).is_err());
    }

    #[test]
    fn calibrates_from_printed_markers() {
        let mut canvas = GrayImage::from_pixel(400, 300, Luma([255]));
        let positions = [(16, 16), (336, 16), (336, 236), (16, 236)];
        for (id, (x, y)) in positions.iter().enumerate() {
            overlay(&mut canvas, &draw_marker(id as u32, 8).unwrap(), *x, *y);
        }
        let frame = Frame::from_image(DynamicImage::ImageLuma8(canvas).to_rgba8());
        let cal = calibrator(MountingMode::Handheld).calibrate(&frame).unwrap();
        assert_eq!(cal.quad.top_left(), Point::new(64.0, 64.0));
        assert_eq!(cal.quad.bottom_right(), Point::new(336.0, 236.0));
    }
}
