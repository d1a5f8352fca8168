// THEORY:
// The `quad_tracker` module gives the detector memory. The detector sees each
// frame in isolation and may report the abacus outline at slightly different
// corners every time, lose it for a frame behind a hand, or report a second,
// unrelated rectangle. The tracker associates those per-frame detections with
// quads it has already seen, and decides when one of them has been present and
// still for long enough to trust.
//
// Key architectural principles:
// 1.  **Track Persistence**: A `TrackedQuad` is one physical outline over time,
//     with an id assigned at birth that never changes.
// 2.  **Resolution-Independent Matching**: A detection belongs to a track when
//     the average distance between their same-index corners is under a fraction
//     of the frame diagonal. Tracks are scanned in creation order and the first
//     one under threshold wins; a track takes at most one detection per frame.
//     The coarse center bucket only skips tracks that cannot possibly match.
// 3.  **Lifecycle Management**:
//     - **Birth**: an unmatched detection starts a new track (one frame seen,
//       one history entry, zero stability).
//     - **Tracking**: a matched track takes the new corners, appends them to a
//       bounded history and recomputes its stability from that window alone.
//     - **Death**: a track unmatched for more than `max_frames_unseen`
//       consecutive frames is pruned, whatever its history.
// 4.  **Trust**: stability maps the mean per-corner standard deviation over the
//     history into [0, 1]. The best track is the recently seen one with the
//     highest `frames * (0.5 + stability) * area^exponent`; it is locked once
//     it has been seen often enough and is stable enough.

use crate::core_modules::geometry::{Point, Quad};
use crate::core_modules::quad_detector::QuadDetector;
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Match threshold as a fraction of the frame diagonal.
    pub match_threshold_ratio: f64,
    /// Corner sets kept per track.
    pub history_size: usize,
    /// A track unmatched for more frames than this is pruned.
    pub max_frames_unseen: u64,
    /// Mean corner standard deviation (pixels) at which stability reaches zero.
    pub stability_scale_px: f64,
    pub lock_min_frames: u32,
    /// Stability must be strictly above this to lock.
    pub lock_min_stability: f64,
    /// Only tracks unseen for at most this many frames compete for best.
    pub best_track_max_age: u64,
    /// Exponent applied to area in the best-track score.
    pub area_exponent: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_threshold_ratio: 0.08,
            history_size: 10,
            max_frames_unseen: 3,
            stability_scale_px: 10.0,
            lock_min_frames: 5,
            lock_min_stability: 0.5,
            best_track_max_age: 1,
            area_exponent: 0.5,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::InvalidConfig(format!("tracker: {msg}")));
        if !(self.match_threshold_ratio > 0.0 && self.match_threshold_ratio.is_finite()) {
            return fail("match_threshold_ratio must be positive");
        }
        if self.history_size < 2 {
            return fail("history_size must be at least 2");
        }
        if !(self.stability_scale_px > 0.0) {
            return fail("stability_scale_px must be positive");
        }
        if !(0.0..=1.0).contains(&self.lock_min_stability) {
            return fail("lock_min_stability must be in [0, 1]");
        }
        if !(self.area_exponent > 0.0 && self.area_exponent <= 1.0) {
            return fail("area_exponent must be in (0, 1]");
        }
        Ok(())
    }
}

/// Synthetic track identity, assigned once at birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quad-{}", self.0)
    }
}

/// A quad followed across frames.
#[derive(Debug, Clone)]
pub struct TrackedQuad {
    pub id: TrackId,
    /// The corners from the most recent matching detection.
    pub quad: Quad,
    pub area: f64,
    pub aspect_ratio: f64,
    /// Frames in which this track received a detection.
    pub frame_count: u32,
    pub last_seen_frame: u64,
    /// Recent corner sets, oldest first.
    pub history: VecDeque<[Point; 4]>,
    pub stability: f64,
}

impl TrackedQuad {
    fn new(id: TrackId, quad: Quad, frame_index: u64, history_size: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_size);
        history.push_back(quad.corners());
        Self {
            id,
            quad,
            area: quad.area(),
            aspect_ratio: quad.aspect_ratio(),
            frame_count: 1,
            last_seen_frame: frame_index,
            history,
            stability: 0.0,
        }
    }

    fn update(&mut self, quad: Quad, frame_index: u64, config: &TrackerConfig) {
        self.quad = quad;
        self.area = quad.area();
        self.aspect_ratio = quad.aspect_ratio();
        self.history.push_back(quad.corners());
        while self.history.len() > config.history_size {
            self.history.pop_front();
        }
        self.stability = stability_score(&self.history, config.stability_scale_px);
        self.frame_count += 1;
        self.last_seen_frame = frame_index;
    }

    pub fn frames_unseen(&self, current_frame: u64) -> u64 {
        current_frame.saturating_sub(self.last_seen_frame)
    }

    pub fn is_locked(&self, config: &TrackerConfig) -> bool {
        is_locked(self.frame_count, self.stability, config)
    }

    pub fn score(&self, config: &TrackerConfig) -> f64 {
        self.frame_count as f64 * (0.5 + self.stability) * self.area.powf(config.area_exponent)
    }
}

/// Maps the mean per-corner standard deviation over `history` into [0, 1].
pub fn stability_score(history: &VecDeque<[Point; 4]>, scale_px: f64) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    let n = history.len() as f64;
    let mut total_std_dev = 0.0;
    for corner in 0..4 {
        let (sx, sy) = history
            .iter()
            .fold((0.0, 0.0), |(sx, sy), c| (sx + c[corner].x, sy + c[corner].y));
        let (mx, my) = (sx / n, sy / n);
        let variance = history
            .iter()
            .map(|c| (c[corner].x - mx).powi(2) + (c[corner].y - my).powi(2))
            .sum::<f64>()
            / n;
        total_std_dev += variance.sqrt();
    }
    (1.0 - (total_std_dev / 4.0) / scale_px).max(0.0)
}

/// Lock requires both enough sightings and strictly more than the minimum stability.
pub fn is_locked(frame_count: u32, stability: f64, config: &TrackerConfig) -> bool {
    frame_count >= config.lock_min_frames && stability > config.lock_min_stability
}

/// The tracker's view of one frame.
#[derive(Debug, Clone)]
pub struct TrackerReport {
    pub frame_index: u64,
    /// Every quad the detector returned for this frame.
    pub detections: Vec<Quad>,
    pub best: Option<TrackedQuad>,
    pub is_stable: bool,
    pub is_locked: bool,
}

/// Matches per-frame detections to persistent tracks.
pub struct QuadTracker {
    detector: QuadDetector,
    config: TrackerConfig,
    /// Live tracks in creation order.
    tracks: Vec<TrackedQuad>,
    next_id: u64,
    frame_index: u64,
}

impl QuadTracker {
    pub fn new(detector: QuadDetector, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector,
            config,
            tracks: Vec::new(),
            next_id: 0,
            frame_index: 0,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[TrackedQuad] {
        &self.tracks
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Detects quads in `frame` and folds them into the track table.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<TrackerReport> {
        let detections = self.detector.detect(frame)?;
        Ok(self.update(detections, frame.diagonal()))
    }

    /// Advances one frame with the given detections.
    pub fn update(&mut self, detections: Vec<Quad>, frame_diagonal: f64) -> TrackerReport {
        self.frame_index += 1;
        let frame_index = self.frame_index;
        let threshold = self.config.match_threshold_ratio * frame_diagonal;

        // --- 1. Matching ---
        let buckets: Vec<_> = self
            .tracks
            .iter()
            .map(|t| t.quad.center_bucket(threshold))
            .collect();
        let mut claimed = vec![false; self.tracks.len()];
        let mut assignments: Vec<Option<usize>> = Vec::with_capacity(detections.len());
        for detection in &detections {
            let bucket = detection.center_bucket(threshold);
            let matched = self.tracks.iter().enumerate().position(|(i, track)| {
                !claimed[i]
                    && buckets[i].is_adjacent(&bucket)
                    && track.quad.average_corner_distance(detection) < threshold
            });
            if let Some(i) = matched {
                claimed[i] = true;
            }
            assignments.push(matched);
        }

        // --- 2. State Updating ---
        for (detection, assignment) in detections.iter().zip(&assignments) {
            match assignment {
                Some(i) => self.tracks[*i].update(*detection, frame_index, &self.config),
                None => {
                    let id = TrackId(self.next_id);
                    self.next_id += 1;
                    trace!(track = %id, "new track");
                    self.tracks.push(TrackedQuad::new(
                        id,
                        *detection,
                        frame_index,
                        self.config.history_size,
                    ));
                }
            }
        }

        // --- 3. Pruning ---
        let max_unseen = self.config.max_frames_unseen;
        self.tracks.retain(|t| {
            let keep = t.frames_unseen(frame_index) <= max_unseen;
            if !keep {
                trace!(track = %t.id, "track pruned");
            }
            keep
        });

        // --- 4. Selection ---
        let best = self.best_track().cloned();
        let is_locked = best.as_ref().is_some_and(|b| b.is_locked(&self.config));
        let is_stable = best
            .as_ref()
            .is_some_and(|b| b.stability > self.config.lock_min_stability);
        if let Some(b) = &best {
            debug!(
                frame = frame_index,
                track = %b.id,
                frames = b.frame_count,
                stability = b.stability,
                locked = is_locked,
                "best track"
            );
        }

        TrackerReport {
            frame_index,
            detections,
            best,
            is_stable,
            is_locked,
        }
    }

    /// Highest-scoring track among those seen recently.
    pub fn best_track(&self) -> Option<&TrackedQuad> {
        self.tracks
            .iter()
            .filter(|t| t.frames_unseen(self.frame_index) <= self.config.best_track_max_age)
            .max_by(|a, b| a.score(&self.config).total_cmp(&b.score(&self.config)))
    }

    /// Forgets every track. Ids keep increasing.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.frame_index = 0;
    }
}
