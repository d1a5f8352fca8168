// THEORY:
// Square fiducial markers: a 4x4 payload of black/white cells inside a one-cell
// black border, printed at the four corners of the abacus. The detector is
// deliberately simple and self-contained:
// 1.  Flood-fill dark connected regions and keep the roughly square ones whose
//     fill ratio looks like a bordered marker.
// 2.  Estimate the four outer corners from the region's extreme pixels
//     (min/max of x+y and x-y), so mildly rotated markers still work.
// 3.  Map the 6x6 cell grid onto those corners with a homography and vote each
//     cell black or white from a few samples around its center.
// 4.  Require an all-black border, then match the payload against the
//     dictionary under all four rotations. Only exact matches are accepted.
//
// The dictionary is generated deterministically and canonicalized so that no
// two entries are rotations of each other.

use crate::core_modules::geometry::{self, Point};
use crate::core_modules::imaging::Homography;
use crate::error::{EngineError, Result};
use image::{GrayImage, Luma};
use std::collections::VecDeque;

const PAYLOAD_BITS: usize = 4;
const BORDER_BITS: usize = 1;
const GRID: usize = PAYLOAD_BITS + 2 * BORDER_BITS;
const DICTIONARY_SIZE: usize = 50;
const DICTIONARY_SEED: u64 = 0xA53A_9E37_5D1C;

/// An identified marker in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiducialMarker {
    pub id: u32,
    /// Outer corners in image order: top-left, top-right, bottom-right, bottom-left.
    pub corners: [Point; 4],
    pub center: Point,
    /// Clockwise quarter turns between the printed and the observed payload.
    pub rotation: u8,
}

impl FiducialMarker {
    pub fn area(&self) -> f64 {
        geometry::polygon_area(&self.corners)
    }

    /// The corner closest to `target`.
    pub fn nearest_corner(&self, target: Point) -> Point {
        self.corners
            .iter()
            .copied()
            .min_by(|a, b| geometry::distance(*a, target).total_cmp(&geometry::distance(*b, target)))
            .unwrap_or(self.center)
    }
}

/// Finds and identifies markers in a grayscale frame.
pub trait MarkerDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<FiducialMarker>;
}

/// Built-in detector for the bordered 4x4 dictionary.
#[derive(Debug, Clone)]
pub struct SquareMarkerDetector {
    /// Pixels at or below this intensity seed dark regions.
    pub dark_threshold: u8,
    /// Smallest accepted region side in pixels.
    pub min_side: u32,
    dictionary: Vec<u64>,
}

impl Default for SquareMarkerDetector {
    fn default() -> Self {
        Self {
            dark_threshold: 80,
            min_side: GRID as u32 * 2,
            dictionary: dictionary(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: usize,
    // Extreme pixels, in image order TL, TR, BR, BL.
    extremes: [(u32, u32); 4],
}

impl MarkerDetector for SquareMarkerDetector {
    fn detect(&self, image: &GrayImage) -> Vec<FiducialMarker> {
        let mut markers = Vec::new();
        for region in self.dark_regions(image) {
            let corners = outer_corners(&region);
            let Some(bits) = sample_grid(image, &corners) else {
                continue;
            };
            if !border_is_black(&bits) {
                continue;
            }
            let payload = extract_payload(&bits);
            if let Some((id, rotation)) = decode(payload, &self.dictionary) {
                markers.push(FiducialMarker {
                    id: id as u32,
                    corners,
                    center: geometry::centroid(&corners),
                    rotation,
                });
            }
        }
        markers
    }
}

impl SquareMarkerDetector {
    fn dark_regions(&self, image: &GrayImage) -> Vec<Region> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let raw = image.as_raw();
        let mut visited = vec![false; w * h];
        let mut regions = Vec::new();
        let mut queue = VecDeque::new();

        for y0 in 0..h {
            for x0 in 0..w {
                let idx0 = y0 * w + x0;
                if visited[idx0] || raw[idx0] > self.dark_threshold {
                    continue;
                }
                visited[idx0] = true;
                queue.push_back((x0, y0));

                let (x0u, y0u) = (x0 as u32, y0 as u32);
                let mut region = Region {
                    min_x: x0u,
                    min_y: y0u,
                    max_x: x0u,
                    max_y: y0u,
                    pixels: 0,
                    extremes: [(x0u, y0u); 4],
                };
                while let Some((x, y)) = queue.pop_front() {
                    region.absorb(x as u32, y as u32);
                    let neighbours = [
                        (x.wrapping_sub(1), y),
                        (x + 1, y),
                        (x, y.wrapping_sub(1)),
                        (x, y + 1),
                    ];
                    for (nx, ny) in neighbours {
                        if nx >= w || ny >= h {
                            continue;
                        }
                        let idx = ny * w + nx;
                        if !visited[idx] && raw[idx] <= self.dark_threshold {
                            visited[idx] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }

                if self.looks_like_marker(&region) {
                    regions.push(region);
                }
            }
        }
        regions
    }

    fn looks_like_marker(&self, r: &Region) -> bool {
        let bw = r.max_x - r.min_x + 1;
        let bh = r.max_y - r.min_y + 1;
        if bw < self.min_side || bh < self.min_side {
            return false;
        }
        let ratio = bw as f64 / bh as f64;
        if !(0.7..=1.3).contains(&ratio) {
            return false;
        }
        let fill = r.pixels as f64 / (bw as f64 * bh as f64);
        (0.18..=0.95).contains(&fill)
    }
}

impl Region {
    fn absorb(&mut self, x: u32, y: u32) {
        self.pixels += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);

        let (xi, yi) = (x as i64, y as i64);
        let key = |(px, py): (u32, u32)| (px as i64, py as i64);
        let [tl, tr, br, bl] = self.extremes.map(key);
        if xi + yi < tl.0 + tl.1 {
            self.extremes[0] = (x, y);
        }
        if xi - yi > tr.0 - tr.1 {
            self.extremes[1] = (x, y);
        }
        if xi + yi > br.0 + br.1 {
            self.extremes[2] = (x, y);
        }
        if xi - yi < bl.0 - bl.1 {
            self.extremes[3] = (x, y);
        }
    }
}

/// Extreme pixels pushed out to the pixel edges they bound.
fn outer_corners(r: &Region) -> [Point; 4] {
    let offsets = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
    let mut corners = [Point::default(); 4];
    for (i, ((x, y), (ox, oy))) in r.extremes.iter().zip(offsets).enumerate() {
        corners[i] = Point::new(*x as f64 + ox, *y as f64 + oy);
    }
    corners
}

/// Votes every grid cell black (1) or white (0) through a cell-space homography.
fn sample_grid(image: &GrayImage, corners: &[Point; 4]) -> Option<Vec<u8>> {
    let g = GRID as f64;
    let cell_space = [
        Point::new(0.0, 0.0),
        Point::new(g, 0.0),
        Point::new(g, g),
        Point::new(0.0, g),
    ];
    let to_image = Homography::fit(&cell_space, corners)?;
    let offsets = [0.3, 0.5, 0.7];

    let mut bits = vec![0u8; GRID * GRID];
    for gy in 0..GRID {
        for gx in 0..GRID {
            let mut black = 0;
            let mut total = 0;
            for oy in offsets {
                for ox in offsets {
                    let p = to_image.map_point(Point::new(gx as f64 + ox, gy as f64 + oy))?;
                    let (px, py) = (p.x.floor(), p.y.floor());
                    if px < 0.0 || py < 0.0 || px >= image.width() as f64 || py >= image.height() as f64 {
                        continue;
                    }
                    total += 1;
                    if image.get_pixel(px as u32, py as u32)[0] < 128 {
                        black += 1;
                    }
                }
            }
            bits[gy * GRID + gx] = u8::from(total > 0 && black * 2 >= total);
        }
    }
    Some(bits)
}

fn border_is_black(bits: &[u8]) -> bool {
    (0..GRID).all(|i| {
        bits[i] == 1
            && bits[(GRID - 1) * GRID + i] == 1
            && bits[i * GRID] == 1
            && bits[i * GRID + GRID - 1] == 1
    })
}

fn extract_payload(bits: &[u8]) -> u64 {
    let mut code = 0u64;
    for y in 0..PAYLOAD_BITS {
        for x in 0..PAYLOAD_BITS {
            if bits[(y + BORDER_BITS) * GRID + x + BORDER_BITS] != 0 {
                code |= 1 << (y * PAYLOAD_BITS + x);
            }
        }
    }
    code
}

/// Exact dictionary match under any rotation: `(id, clockwise quarter turns)`.
fn decode(payload: u64, dictionary: &[u64]) -> Option<(usize, u8)> {
    let variants = rotations(payload);
    dictionary.iter().enumerate().find_map(|(id, code)| {
        variants
            .iter()
            .position(|v| v == code)
            .map(|rotation| (id, rotation as u8))
    })
}

fn rotations(code: u64) -> [u64; 4] {
    let mut out = [code; 4];
    for i in 1..4 {
        out[i] = rotate_quarter(out[i - 1]);
    }
    out
}

fn rotate_quarter(code: u64) -> u64 {
    let side = PAYLOAD_BITS;
    let mut out = 0u64;
    for y in 0..side {
        for x in 0..side {
            if (code >> (y * side + x)) & 1 == 1 {
                let (nx, ny) = (side - 1 - y, x);
                out |= 1 << (ny * side + nx);
            }
        }
    }
    out
}

/// Deterministic dictionary of rotation-canonical 16-bit payloads.
fn dictionary() -> Vec<u64> {
    let bits = PAYLOAD_BITS * PAYLOAD_BITS;
    let mask = (1u64 << bits) - 1;
    let mut out = Vec::with_capacity(DICTIONARY_SIZE);
    let mut state = DICTIONARY_SEED;
    while out.len() < DICTIONARY_SIZE {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let code = (state >> 24) & mask;
        let ones = code.count_ones() as usize;
        if ones < bits / 4 || ones > bits * 3 / 4 {
            continue;
        }
        let variants = rotations(code);
        // Rotationally symmetric payloads cannot report orientation.
        if variants[1..].contains(&code) {
            continue;
        }
        let canonical = variants.into_iter().min().unwrap_or(code);
        if !out.contains(&canonical) {
            out.push(canonical);
        }
    }
    out
}

/// Renders marker `id` with `cell_size` pixel cells, white background cells included.
pub fn draw_marker(id: u32, cell_size: u32) -> Result<GrayImage> {
    let codes = dictionary();
    let code = *codes.get(id as usize).ok_or_else(|| {
        EngineError::InvalidConfig(format!(
            "marker id {id} is outside the {DICTIONARY_SIZE}-entry dictionary"
        ))
    })?;
    if cell_size == 0 {
        return Err(EngineError::InvalidConfig("marker cell size must be positive".into()));
    }

    let size = GRID as u32 * cell_size;
    let mut img = GrayImage::from_pixel(size, size, Luma([255]));
    for gy in 0..GRID {
        for gx in 0..GRID {
            let border = gx < BORDER_BITS
                || gy < BORDER_BITS
                || gx >= GRID - BORDER_BITS
                || gy >= GRID - BORDER_BITS;
            let black = border || {
                let bit = (gy - BORDER_BITS) * PAYLOAD_BITS + (gx - BORDER_BITS);
                (code >> bit) & 1 == 1
            };
            if !black {
                continue;
            }
            let (x0, y0) = (gx as u32 * cell_size, gy as u32 * cell_size);
            for y in y0..y0 + cell_size {
                for x in x0..x0 + cell_size {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::imageops::{overlay, rotate90};

    fn canvas_with(markers: &[(u32, i64, i64)], cell: u32) -> GrayImage {
        let mut canvas = GrayImage::from_pixel(320, 240, Luma([255]));
        for &(id, x, y) in markers {
            overlay(&mut canvas, &draw_marker(id, cell).unwrap(), x, y);
        }
        canvas
    }

    #[test]
    fn dictionary_is_stable_and_rotation_unique() {
        let a = dictionary();
        assert_eq!(a, dictionary());
        assert_eq!(a.len(), DICTIONARY_SIZE);
        for (i, code) in a.iter().enumerate() {
            for other in &a[i + 1..] {
                assert!(!rotations(*code).contains(other));
            }
        }
    }

    #[test]
    fn draws_and_detects_single_marker() {
        let canvas = canvas_with(&[(7, 40, 30)], 10);
        let found = SquareMarkerDetector::default().detect(&canvas);
        assert_eq!(found.len(), 1);
        let m = found[0];
        assert_eq!(m.id, 7);
        assert_eq!(m.rotation, 0);
        assert_eq!(m.corners[0], Point::new(40.0, 30.0));
        assert_eq!(m.corners[2], Point::new(100.0, 90.0));
        assert_eq!(m.area(), 3600.0);
    }

    #[test]
    fn detects_rotated_marker() {
        let marker = rotate90(&draw_marker(3, 8).unwrap());
        let mut canvas = GrayImage::from_pixel(160, 160, Luma([255]));
        overlay(&mut canvas, &marker, 50, 40);
        let found = SquareMarkerDetector::default().detect(&canvas);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 3);
        assert_ne!(found[0].rotation, 0);
    }

    #[test]
    fn detects_several_markers_in_one_frame() {
        let canvas = canvas_with(&[(0, 10, 10), (1, 250, 10), (2, 250, 170), (3, 10, 170)], 8);
        let mut ids: Vec<_> = SquareMarkerDetector::default()
            .detect(&canvas)
            .iter()
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn nearest_corner_points_inward() {
        let canvas = canvas_with(&[(5, 20, 20)], 10);
        let m = SquareMarkerDetector::default().detect(&canvas)[0];
        assert_eq!(m.nearest_corner(Point::new(160.0, 120.0)), Point::new(80.0, 80.0));
    }

    #[test]
    fn rejects_unknown_id() {
        assert!(draw_marker(DICTIONARY_SIZE as u32, 4).is_err());
    }
}
