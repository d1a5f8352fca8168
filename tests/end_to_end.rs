use abacus_vision::core_modules::markers::draw_marker;
use abacus_vision::{
    CalibrationSource, CaptureSession, ColumnClassifier, ColumnDigit, DetectionMode, EngineConfig, EngineContext,
    Frame, Point, spawn,
};
use image::imageops::overlay;
use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

/// Reads every column as the digit its index in a fixed sequence names.
struct Sequence {
    digits: Vec<u8>,
    next: usize,
}

impl Sequence {
    fn new(digits: &[u8]) -> Box<Self> {
        Box::new(Self {
            digits: digits.to_vec(),
            next: 0,
        })
    }
}

impl ColumnClassifier for Sequence {
    fn classify(&mut self, _column: &GrayImage) -> Option<ColumnDigit> {
        let digit = self.digits[self.next % self.digits.len()];
        self.next += 1;
        Some(ColumnDigit { digit, confidence: 0.95 })
    }
}

fn card_frame() -> Frame {
    let mut img = RgbaImage::from_pixel(640, 480, Rgba([30, 30, 30, 255]));
    draw_filled_rect_mut(&mut img, Rect::at(120, 90).of_size(400, 300), Rgba([220, 220, 220, 255]));
    Frame::from_image(img)
}

fn marker_frame(ids: &[u32]) -> Frame {
    let mut canvas = GrayImage::from_pixel(400, 300, Luma([255]));
    let positions = [(16, 16), (336, 16), (336, 236), (16, 236)];
    for (&id, (x, y)) in ids.iter().zip(positions) {
        overlay(&mut canvas, &draw_marker(id, 8).unwrap(), x, y);
    }
    Frame::from_image(DynamicImage::ImageLuma8(canvas).to_rgba8())
}

fn fiducial_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.detection_mode = DetectionMode::Fiducial;
    config
}

#[tokio::test]
async fn tracked_card_locks_and_rectifies() {
    let mut session = CaptureSession::start(
        EngineContext::imageproc(),
        EngineConfig::default(),
        Some(Sequence::new(&[1, 2, 0, 4, 8])),
    )
    .await
    .unwrap();

    let reports: Vec<_> = (0..6).map(|_| session.process_frame(card_frame()).unwrap()).collect();
    for report in &reports {
        assert_eq!(report.detections.len(), 1);
    }
    assert!(reports[..4].iter().all(|r| !r.is_locked && r.rectified.is_none()));
    assert!(reports[4].is_locked);
    assert!(reports[4].calibration_changed);

    for report in &reports[4..] {
        let rectified = report.rectified.as_ref().unwrap();
        let (w, h) = rectified.image.dimensions();
        assert!((w as i32 - 400).abs() <= 8, "width {w}");
        assert!((h as i32 - 300).abs() <= 8, "height {h}");
        assert_eq!(report.reading.as_ref().unwrap().value, 12048);
    }
    assert_eq!(reports[5].stability.consecutive_frames, 2);
    assert_eq!(reports[5].stability.stable_value, None);
}

#[tokio::test]
async fn fiducial_markers_calibrate_in_one_frame() {
    let mut session = CaptureSession::start(
        EngineContext::imageproc(),
        fiducial_config(),
        Some(Sequence::new(&[9])),
    )
    .await
    .unwrap();

    let first = session.process_frame(marker_frame(&[0, 1, 2, 3])).unwrap();
    assert!(first.is_locked);
    assert!(first.calibration_changed);
    let grid = first.calibration.as_ref().unwrap();
    assert_eq!(grid.source(), CalibrationSource::Fiducial);
    let quad = grid.quad().unwrap();
    assert_eq!(quad.top_left(), Point::new(64.0, 64.0));
    assert_eq!(quad.bottom_right(), Point::new(336.0, 236.0));
    assert_eq!(first.rectified.as_ref().unwrap().image.dimensions(), (272, 172));
    assert_eq!(first.reading.as_ref().unwrap().value, 99999);

    let second = session.process_frame(marker_frame(&[0, 1, 2, 3])).unwrap();
    assert!(!second.calibration_changed);
}

#[tokio::test]
async fn partial_marker_set_keeps_prior_calibration() {
    let mut session = CaptureSession::start(EngineContext::imageproc(), fiducial_config(), None)
        .await
        .unwrap();

    let missing = session.process_frame(marker_frame(&[0, 1, 2])).unwrap();
    assert!(!missing.is_locked);
    assert!(missing.calibration.is_none());

    session.process_frame(marker_frame(&[0, 1, 2, 3])).unwrap();
    let before = session.calibration().cloned().unwrap();

    let again = session.process_frame(marker_frame(&[0, 1, 2])).unwrap();
    assert!(!again.is_locked);
    assert_eq!(again.calibration.as_ref(), Some(&before));
    assert!(again.rectified.is_some());
}

#[tokio::test]
async fn spawned_session_drops_but_counts_frames() {
    let session = CaptureSession::start(EngineContext::imageproc(), EngineConfig::default(), None)
        .await
        .unwrap();
    let mut handle = spawn(session);

    let mut reports = handle.reports();
    handle.submit(card_frame()).unwrap();
    reports.changed().await.unwrap();
    for _ in 0..9 {
        handle.submit(card_frame()).unwrap();
    }

    let submitted = handle.submitted();
    let session = handle.shutdown().await.unwrap();
    assert_eq!(submitted, 10);
    assert_eq!(session.frames_processed() + session.frames_dropped(), submitted);
}
