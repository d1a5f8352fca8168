// THEORY:
// The `pipeline` module is the top-level API of the engine. A `CaptureSession`
// owns one of every component and runs a camera frame through all of them in a
// fixed order:
//
// 1.  Motion. The frame is diffed against the previous one; a hand moving
//     through the view clears any reading in progress.
// 2.  Detection. Either the quad tracker (waiting for a stable lock) or the
//     fiducial calibrator (one frame is enough) produces the device outline.
//     The first lock, or every fiducial success, becomes the calibration.
// 3.  Rectification. The locked quad, or failing that the calibration quad, is
//     warped upright. A numerical failure here means "no output this frame".
// 4.  Reading. The upright image is cut into columns, classified, combined and
//     debounced.
//
// One frame is processed completely before the next is looked at. `spawn`
// moves a session onto a tokio task fed through a watch channel: only the most
// recent frame is kept, and frames overwritten before the task got to them are
// counted as dropped.

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::core_modules::calibration::{CalibrationGrid, CalibrationSource};
use crate::core_modules::fiducial::{FiducialCalibrator, MountingMode};
use crate::core_modules::geometry::Quad;
use crate::core_modules::quad_detector::QuadDetector;
use crate::core_modules::quad_tracker::{QuadTracker, TrackedQuad};
use crate::core_modules::reading::{self, ColumnClassifier, ColumnReading};
use crate::core_modules::rectifier::{PerspectiveRectifier, RectifiedImage};
use crate::core_modules::stability::{StabilityReport, ValueStabilityFilter};
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Which path produces the device outline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetectionMode {
    /// Edge-based detection smoothed by the quad tracker.
    #[default]
    TrackedQuad,
    /// Four printed corner markers.
    Fiducial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub detection_mode: DetectionMode,
    /// Rods on the abacus.
    pub column_count: usize,
    /// Capture a calibration the first time the tracker locks.
    pub auto_calibrate_on_lock: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detection_mode: DetectionMode::TrackedQuad,
            column_count: 5,
            auto_calibrate_on_lock: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.column_count == 0 {
            return Err(EngineError::InvalidConfig(
                "session: column_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Everything a UI needs to draw one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame_index: u64,
    pub detections: Vec<Quad>,
    pub best: Option<TrackedQuad>,
    pub is_stable: bool,
    /// Tracker lock, or a fiducial calibration found in this frame.
    pub is_locked: bool,
    pub calibration: Option<CalibrationGrid>,
    /// The calibration was replaced while processing this frame.
    pub calibration_changed: bool,
    pub rectified: Option<RectifiedImage>,
    pub reading: Option<ColumnReading>,
    pub stability: StabilityReport,
    /// `None` for the first frame or after a resolution change.
    pub motion_ratio: Option<f64>,
    /// Frames superseded in the session queue before this one was taken.
    pub frames_dropped: u64,
}

/// Outcome of the detection stage for one frame.
struct Detection {
    detections: Vec<Quad>,
    best: Option<TrackedQuad>,
    is_stable: bool,
    is_locked: bool,
    calibration_changed: bool,
}

pub struct CaptureSession {
    ctx: EngineContext,
    config: EngineConfig,
    tracker: QuadTracker,
    calibrator: FiducialCalibrator,
    rectifier: PerspectiveRectifier,
    stability: ValueStabilityFilter,
    classifier: Option<Box<dyn ColumnClassifier>>,
    calibration: Option<CalibrationGrid>,
    previous_frame: Option<Arc<Frame>>,
    frames_processed: u64,
    frames_dropped: u64,
}

impl CaptureSession {
    /// Validates `config`, waits for the imaging backend, and builds every
    /// component. Without a classifier the session still detects, calibrates
    /// and rectifies but never produces a reading.
    pub async fn start(
        ctx: EngineContext,
        config: EngineConfig,
        classifier: Option<Box<dyn ColumnClassifier>>,
    ) -> Result<Self> {
        config.validate()?;
        ctx.ready().await?;

        let detector = QuadDetector::new(ctx.clone(), config.detector.clone())?;
        let tracker = QuadTracker::new(detector, config.tracker.clone())?;
        let calibrator = FiducialCalibrator::new(ctx.clone(), config.fiducial.clone())?;
        let rectifier = PerspectiveRectifier::new(ctx.clone(), config.rectifier.clone());
        let stability = ValueStabilityFilter::new(config.stability.clone())?;

        info!(
            mode = ?config.session.detection_mode,
            columns = config.session.column_count,
            classifier = classifier.is_some(),
            "capture session started"
        );
        Ok(Self {
            ctx,
            config,
            tracker,
            calibrator,
            rectifier,
            stability,
            classifier,
            calibration: None,
            previous_frame: None,
            frames_processed: 0,
            frames_dropped: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calibration(&self) -> Option<&CalibrationGrid> {
        self.calibration.as_ref()
    }

    pub fn stability(&self) -> StabilityReport {
        self.stability.snapshot()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Frames superseded before a spawned session could take them.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Replaces the calibration with a manually entered grid. The reading in
    /// progress belonged to the old columns and is discarded.
    pub fn manual_calibrate(&mut self, grid: CalibrationGrid) {
        info!(columns = grid.column_count(), source = ?grid.source(), "calibration replaced");
        self.calibration = Some(grid);
        self.stability.reset();
    }

    /// Discards tracks, stability state and the previous frame.
    pub fn reset(&mut self, clear_calibration: bool) {
        self.tracker.reset();
        self.stability.reset();
        self.previous_frame = None;
        if clear_calibration {
            self.calibration = None;
        }
        debug!(clear_calibration, "capture session reset");
    }

    /// Runs one frame through the pipeline. A shared frame is kept for the
    /// next motion check without copying its pixels.
    pub fn process_frame(&mut self, frame: impl Into<Arc<Frame>>) -> Result<FrameReport> {
        let frame: Arc<Frame> = frame.into();
        self.ctx.backend()?;
        self.frames_processed += 1;

        // --- 1. Motion ---
        let motion_ratio = match &self.previous_frame {
            Some(previous) if previous.image().dimensions() == frame.image().dimensions() => {
                Some(self.stability.push_frame_diff(frame.image(), previous.image())?)
            }
            Some(_) => {
                debug!("frame size changed; skipping motion check");
                None
            }
            None => None,
        };

        // --- 2. Detection ---
        let detection = match self.config.session.detection_mode {
            DetectionMode::TrackedQuad => self.detect_tracked(&frame)?,
            DetectionMode::Fiducial => self.detect_fiducial(&frame)?,
        };

        // --- 3. Rectification ---
        let target = match (&detection.best, &self.calibration) {
            (Some(best), _) if detection.is_locked => Some((best.quad, self.mounting())),
            (_, Some(grid)) if grid.quad().is_some() => Some((grid.target_quad(), grid.mounting())),
            _ => None,
        };
        let rectified = match target {
            Some((quad, mounting)) => match self.rectifier.rectify(frame.image(), &quad, mounting) {
                Ok(rectified) => Some(rectified),
                Err(EngineError::TransformFailed(reason)) => {
                    debug!(%reason, "no rectified output this frame");
                    None
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        // --- 4. Reading ---
        let reading = self.read(&frame, rectified.as_ref());
        if let Some(r) = &reading {
            self.stability.push_frame(r.value, r.confidence);
        }

        self.previous_frame = Some(frame);
        let stability = self.stability.snapshot();
        trace!(
            frame = self.frames_processed,
            detections = detection.detections.len(),
            rectified = rectified.is_some(),
            stable = ?stability.stable_value,
            "frame processed"
        );
        Ok(FrameReport {
            frame_index: self.frames_processed,
            detections: detection.detections,
            best: detection.best,
            is_stable: detection.is_stable,
            is_locked: detection.is_locked,
            calibration: self.calibration.clone(),
            calibration_changed: detection.calibration_changed,
            rectified,
            reading,
            stability,
            motion_ratio,
            frames_dropped: 0,
        })
    }

    /// The camera mounting quads are rectified for.
    fn mounting(&self) -> MountingMode {
        self.calibration
            .as_ref()
            .map_or(self.config.fiducial.mounting, |grid| grid.mounting())
    }

    fn detect_tracked(&mut self, frame: &Frame) -> Result<Detection> {
        let report = self.tracker.process_frame(frame)?;
        let mut calibration_changed = false;
        if report.is_locked && self.config.session.auto_calibrate_on_lock && self.calibration.is_none() {
            if let Some(best) = &report.best {
                match CalibrationGrid::from_quad(
                    best.quad,
                    self.config.session.column_count,
                    self.config.fiducial.mounting,
                    CalibrationSource::TrackedQuad,
                ) {
                    Ok(grid) => {
                        info!(track = %best.id, area = best.area, "calibrated from tracker lock");
                        self.calibration = Some(grid);
                        calibration_changed = true;
                    }
                    Err(err) => debug!(error = %err, "locked quad rejected as calibration"),
                }
            }
        }
        Ok(Detection {
            detections: report.detections,
            best: report.best,
            is_stable: report.is_stable,
            is_locked: report.is_locked,
            calibration_changed,
        })
    }

    fn detect_fiducial(&mut self, frame: &Frame) -> Result<Detection> {
        let mut detection = Detection {
            detections: Vec::new(),
            best: None,
            is_stable: false,
            is_locked: false,
            calibration_changed: false,
        };
        let found = match self.calibrator.calibrate(frame) {
            Ok(found) => found,
            Err(EngineError::InvalidCalibration(rejection)) => {
                trace!(%rejection, "no fiducial calibration this frame");
                return Ok(detection);
            }
            Err(err) => return Err(err),
        };

        detection.detections.push(found.quad);
        detection.is_locked = true;
        match CalibrationGrid::from_quad(
            found.quad,
            self.config.session.column_count,
            found.mounting,
            CalibrationSource::Fiducial,
        ) {
            Ok(grid) => {
                if self.calibration.as_ref() != Some(&grid) {
                    info!(area = found.quad.area(), "calibrated from fiducial markers");
                    detection.calibration_changed = true;
                }
                self.calibration = Some(grid);
            }
            Err(err) => debug!(error = %err, "fiducial quad rejected as calibration"),
        }
        Ok(detection)
    }

    /// Slices and classifies the upright view: the rectified image, or the
    /// region of interest of a quad-less calibration.
    fn read(&mut self, frame: &Frame, rectified: Option<&RectifiedImage>) -> Option<ColumnReading> {
        let grid = self.calibration.as_ref()?;
        let classifier = self.classifier.as_mut()?;
        let cropped: RgbaImage;
        let upright = match rectified {
            Some(r) => &r.image,
            None if grid.quad().is_none() => {
                let roi = grid.roi();
                cropped = image::imageops::crop_imm(frame.image(), roi.x, roi.y, roi.width, roi.height).to_image();
                &cropped
            }
            None => return None,
        };
        if upright.width() == 0 || upright.height() == 0 {
            return None;
        }
        reading::read_columns(classifier.as_mut(), &grid.slice_columns(upright))
    }
}

/// A capture session running on its own tokio task.
pub struct SessionHandle {
    frames: watch::Sender<Option<(u64, Arc<Frame>)>>,
    reports: watch::Receiver<Option<Arc<FrameReport>>>,
    next_seq: u64,
    task: JoinHandle<CaptureSession>,
}

/// Moves `session` onto a tokio task. Must be called inside a runtime.
pub fn spawn(mut session: CaptureSession) -> SessionHandle {
    let (frame_tx, mut frame_rx) = watch::channel::<Option<(u64, Arc<Frame>)>>(None);
    let (report_tx, report_rx) = watch::channel::<Option<Arc<FrameReport>>>(None);

    let task = tokio::spawn(async move {
        let mut last_seq = 0u64;
        while frame_rx.changed().await.is_ok() {
            let Some((seq, frame)) = frame_rx.borrow_and_update().clone() else {
                continue;
            };
            let dropped = seq.saturating_sub(last_seq + 1);
            last_seq = seq;
            session.frames_dropped += dropped;

            match session.process_frame(frame) {
                Ok(mut report) => {
                    report.frames_dropped = dropped;
                    report_tx.send_replace(Some(Arc::new(report)));
                }
                Err(err) if err.is_retryable() => debug!(error = %err, "frame skipped"),
                Err(err) => warn!(error = %err, "frame rejected"),
            }
        }
        debug!(processed = session.frames_processed, dropped = session.frames_dropped, "session worker stopped");
        session
    });

    SessionHandle {
        frames: frame_tx,
        reports: report_rx,
        next_seq: 0,
        task,
    }
}

impl SessionHandle {
    /// Hands a frame to the worker, replacing any frame it has not taken yet.
    pub fn submit(&mut self, frame: Frame) -> Result<()> {
        self.next_seq += 1;
        self.frames
            .send(Some((self.next_seq, Arc::new(frame))))
            .map_err(|_| EngineError::SessionClosed)
    }

    /// Frames submitted so far.
    pub fn submitted(&self) -> u64 {
        self.next_seq
    }

    /// Receiver of the most recent report.
    pub fn reports(&self) -> watch::Receiver<Option<Arc<FrameReport>>> {
        self.reports.clone()
    }

    pub fn latest_report(&self) -> Option<Arc<FrameReport>> {
        self.reports.borrow().clone()
    }

    /// Lets the worker finish the pending frame, then returns the session.
    pub async fn shutdown(self) -> Result<CaptureSession> {
        let SessionHandle { frames, task, .. } = self;
        drop(frames);
        task.await.map_err(|err| {
            warn!(error = %err, "session worker did not stop cleanly");
            EngineError::SessionClosed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::calibration::RegionOfInterest;
    use crate::core_modules::imaging::ImagingBackend;
    use crate::core_modules::reading::ColumnDigit;
    use image::{GrayImage, Rgba};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    /// Answers the same digit for every column.
    struct Constant(u8);

    impl ColumnClassifier for Constant {
        fn classify(&mut self, _column: &GrayImage) -> Option<ColumnDigit> {
            Some(ColumnDigit {
                digit: self.0,
                confidence: 0.9,
            })
        }
    }

    fn card_frame() -> Frame {
        let mut img = RgbaImage::from_pixel(640, 480, Rgba([30, 30, 30, 255]));
        draw_filled_rect_mut(&mut img, Rect::at(120, 90).of_size(400, 300), Rgba([220, 220, 220, 255]));
        Frame::from_image(img)
    }

    fn empty_frame() -> Frame {
        Frame::from_image(RgbaImage::from_pixel(640, 480, Rgba([30, 30, 30, 255])))
    }

    async fn session(classifier: Option<Box<dyn ColumnClassifier>>) -> CaptureSession {
        CaptureSession::start(EngineContext::imageproc(), EngineConfig::default(), classifier)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn shared_frame_is_kept_without_copying() {
        let mut s = session(None).await;
        let frame = Arc::new(card_frame());
        s.process_frame(Arc::clone(&frame)).unwrap();
        let kept = s.previous_frame.as_ref().unwrap();
        assert!(Arc::ptr_eq(kept, &frame));
        assert_eq!(Arc::strong_count(&frame), 2);

        let report = s.process_frame(Arc::clone(&frame)).unwrap();
        assert_eq!(report.motion_ratio, Some(0.0));
        assert_eq!(Arc::strong_count(&frame), 2);
    }

    #[tokio::test]
    async fn locks_calibrates_and_settles() {
        let mut s = session(Some(Box::new(Constant(3)))).await;
        let mut reports = Vec::new();
        for _ in 0..7 {
            reports.push(s.process_frame(card_frame()).unwrap());
        }

        assert!(!reports[3].is_locked);
        assert!(reports[3].calibration.is_none());
        assert!(reports[3].rectified.is_none());

        let locked = &reports[4];
        assert!(locked.is_locked);
        assert!(locked.calibration_changed);
        let grid = locked.calibration.as_ref().unwrap();
        assert_eq!(grid.source(), CalibrationSource::TrackedQuad);
        assert_eq!(grid.column_count(), 5);
        assert!(locked.rectified.is_some());
        assert_eq!(locked.reading.as_ref().unwrap().value, 33333);
        assert!(!reports[5].calibration_changed);

        assert_eq!(reports[5].stability.stable_value, None);
        assert_eq!(reports[6].stability.stable_value, Some(33333));
        assert_eq!(reports[6].motion_ratio, Some(0.0));
    }

    #[tokio::test]
    async fn calibration_survives_device_leaving_view() {
        let mut s = session(None).await;
        for _ in 0..5 {
            s.process_frame(card_frame()).unwrap();
        }
        assert!(s.calibration().is_some());

        let gone = s.process_frame(empty_frame()).unwrap();
        assert!(gone.detections.is_empty());
        assert!(gone.stability.is_hand_detected);
        // A track missed for one frame still competes for best.
        assert!(gone.is_locked);

        let report = s.process_frame(empty_frame()).unwrap();
        assert!(report.best.is_none());
        assert!(!report.is_locked);
        assert!(report.calibration.is_some());
        // The stored calibration quad still rectifies.
        assert!(report.rectified.is_some());
        assert!(report.reading.is_none());
        assert!(!report.stability.is_hand_detected);
    }

    #[tokio::test]
    async fn manual_roi_reads_without_rectifying() {
        let mut s = session(Some(Box::new(Constant(7)))).await;
        let roi = RegionOfInterest {
            x: 100,
            y: 100,
            width: 300,
            height: 200,
        };
        s.manual_calibrate(CalibrationGrid::uniform(roi, 2, CalibrationSource::Manual).unwrap());

        let report = s.process_frame(empty_frame()).unwrap();
        assert!(report.rectified.is_none());
        assert_eq!(report.reading.unwrap().value, 77);
    }

    #[tokio::test]
    async fn reset_keeps_calibration_unless_asked() {
        let mut s = session(None).await;
        for _ in 0..5 {
            s.process_frame(card_frame()).unwrap();
        }
        s.reset(false);
        assert!(s.calibration().is_some());
        let report = s.process_frame(card_frame()).unwrap();
        assert_eq!(report.motion_ratio, None);
        assert!(!report.is_locked);

        s.reset(true);
        assert!(s.calibration().is_none());
    }

    #[tokio::test]
    async fn start_surfaces_backend_failure() {
        let ctx = EngineContext::new(async {
            Err::<Arc<dyn ImagingBackend>, _>(EngineError::Unavailable("no backend".into()))
        });
        let result = CaptureSession::start(ctx, EngineConfig::default(), None).await;
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.session.column_count = 0;
        let result = CaptureSession::start(EngineContext::imageproc(), config, None).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn spawned_session_accounts_for_every_frame() {
        let mut handle = spawn(session(None).await);
        for _ in 0..12 {
            handle.submit(card_frame()).unwrap();
        }
        let submitted = handle.submitted();
        let s = handle.shutdown().await.unwrap();
        assert_eq!(s.frames_processed() + s.frames_dropped(), submitted);
        assert!(s.frames_processed() >= 1);
    }

    #[tokio::test]
    async fn reports_arrive_on_watch_channel() {
        let mut handle = spawn(session(None).await);
        let mut reports = handle.reports();
        handle.submit(card_frame()).unwrap();
        reports.changed().await.unwrap();
        let report = reports.borrow().clone().unwrap();
        assert_eq!(report.detections.len(), 1);
        assert!(handle.latest_report().is_some());
        handle.shutdown().await.unwrap();
    }
}
