// Example runner for the `abacus_vision` library. Feeds a synthetic camera
// stream (a bright card on a dark desk, with a hand passing through midway)
// into a spawned capture session and logs what the engine reports.
//
// Usage: abacus_vision [config.json]

use abacus_vision::{CaptureSession, EngineConfig, EngineContext, Frame, spawn};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use std::time::Duration;
use tracing::info;

const FRAMES: u32 = 30;

fn synthetic_frame(index: u32) -> Frame {
    let mut img = RgbaImage::from_pixel(640, 480, Rgba([30, 30, 30, 255]));
    draw_filled_rect_mut(&mut img, Rect::at(120, 90).of_size(400, 300), Rgba([220, 220, 220, 255]));
    if (12..16).contains(&index) {
        let x = 60 + (index as i32 - 12) * 120;
        draw_filled_rect_mut(&mut img, Rect::at(x, 200).of_size(140, 200), Rgba([180, 130, 100, 255]));
    }
    Frame::from_image(img)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => EngineConfig::default(),
    };

    let session = CaptureSession::start(EngineContext::imageproc(), config, None)
        .await
        .context("starting capture session")?;
    let mut handle = spawn(session);
    let mut reports = handle.reports();

    for index in 0..FRAMES {
        handle.submit(synthetic_frame(index))?;
        match tokio::time::timeout(Duration::from_millis(500), reports.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
        let Some(report) = reports.borrow_and_update().clone() else {
            continue;
        };
        info!(
            frame = report.frame_index,
            detections = report.detections.len(),
            locked = report.is_locked,
            calibrated = report.calibration.is_some(),
            rectified = ?report.rectified.as_ref().map(|r| r.image.dimensions()),
            motion = ?report.motion_ratio,
            hand = report.stability.is_hand_detected,
            "frame"
        );
        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    let session = handle.shutdown().await?;
    info!(
        processed = session.frames_processed(),
        dropped = session.frames_dropped(),
        calibrated = session.calibration().is_some(),
        "done"
    );
    Ok(())
}
