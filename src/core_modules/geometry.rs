// THEORY:
// The geometry module is the leaf of the engine. Everything above it (detector,
// tracker, calibrator, rectifier) speaks in `Point`s and `Quad`s, and every
// `Quad` is stored in one canonical corner order: top-left, top-right,
// bottom-right, bottom-left. The order is established here, at construction,
// and nothing downstream ever trusts the order in which a contour walk or a
// marker detector happened to report its points.
//
// Corner ordering:
// 1.  Sort the four points by angle around their centroid. With image
//     coordinates (y grows downwards) ascending angle walks the quad clockwise
//     on screen.
// 2.  Pick the point with the smallest `x + y` as the top-left anchor (first
//     one in angular order on ties).
// 3.  Rotate the sorted ring so the anchor comes first.
//
// The result depends only on the set of points, so it is deterministic and
// idempotent.

use serde::{Deserialize, Serialize};

/// Below this area (in square pixels) a quad is considered degenerate.
const MIN_QUAD_AREA: f64 = 1.0;

/// A 2D coordinate in frame pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        distance(*self, *other)
    }
}

/// Euclidean distance between two points.
pub fn distance(a: Point, b: Point) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// Arithmetic mean of a point set. The origin for an empty set.
pub fn centroid(points: &[Point]) -> Point {
    if points.is_empty() {
        return Point::default();
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point::new(sx / n, sy / n)
}

/// Unsigned polygon area via the shoelace formula.
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        twice_area += a.x * b.y - b.x * a.y;
    }
    (twice_area / 2.0).abs()
}

/// Orders four points as top-left, top-right, bottom-right, bottom-left.
pub fn order_corners(points: [Point; 4]) -> [Point; 4] {
    let center = centroid(&points);
    let angle = |p: &Point| (p.y - center.y).atan2(p.x - center.x);

    let mut ring = points;
    ring.sort_by(|a, b| angle(a).total_cmp(&angle(b)));

    let anchor = (0..4)
        .min_by(|&i, &j| (ring[i].x + ring[i].y).total_cmp(&(ring[j].x + ring[j].y)))
        .unwrap_or(0);
    ring.rotate_left(anchor);
    ring
}

/// True when every turn of the closed polygon has the same, non-zero sign.
pub fn is_convex(points: &[Point]) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0f64;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
        if cross.abs() <= f64::EPSILON {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Coarse grid cell of a quad's centroid. A pre-filter only, never an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CenterBucket {
    pub col: i64,
    pub row: i64,
}

impl CenterBucket {
    /// Same cell or one of the eight neighbours.
    pub fn is_adjacent(&self, other: &CenterBucket) -> bool {
        (self.col - other.col).abs() <= 1 && (self.row - other.row).abs() <= 1
    }
}

/// Four corners in canonical order (TL, TR, BR, BL).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[Point; 4]", into = "[Point; 4]")]
pub struct Quad {
    corners: [Point; 4],
}

impl Quad {
    pub fn new(points: [Point; 4]) -> Self {
        Self {
            corners: order_corners(points),
        }
    }

    /// An upright rectangle with its top-left corner at `(x, y)`.
    pub fn axis_aligned(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new([
            Point::new(x, y),
            Point::new(x + width, y),
            Point::new(x + width, y + height),
            Point::new(x, y + height),
        ])
    }

    pub fn corners(&self) -> [Point; 4] {
        self.corners
    }

    pub fn top_left(&self) -> Point {
        self.corners[0]
    }

    pub fn top_right(&self) -> Point {
        self.corners[1]
    }

    pub fn bottom_right(&self) -> Point {
        self.corners[2]
    }

    pub fn bottom_left(&self) -> Point {
        self.corners[3]
    }

    pub fn area(&self) -> f64 {
        polygon_area(&self.corners)
    }

    /// Side lengths in the order top, right, bottom, left.
    pub fn side_lengths(&self) -> [f64; 4] {
        let [tl, tr, br, bl] = self.corners;
        [
            distance(tl, tr),
            distance(tr, br),
            distance(br, bl),
            distance(bl, tl),
        ]
    }

    /// Mean of the top and bottom sides.
    pub fn width(&self) -> f64 {
        let [top, _, bottom, _] = self.side_lengths();
        (top + bottom) / 2.0
    }

    /// Mean of the left and right sides.
    pub fn height(&self) -> f64 {
        let [_, right, _, left] = self.side_lengths();
        (left + right) / 2.0
    }

    /// Longer side over shorter side, always >= 1. Infinite for a collapsed quad.
    pub fn aspect_ratio(&self) -> f64 {
        let (w, h) = (self.width(), self.height());
        let (long, short) = if w >= h { (w, h) } else { (h, w) };
        if short <= f64::EPSILON {
            f64::INFINITY
        } else {
            long / short
        }
    }

    pub fn centroid(&self) -> Point {
        centroid(&self.corners)
    }

    pub fn is_convex(&self) -> bool {
        is_convex(&self.corners)
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() < MIN_QUAD_AREA || !self.is_convex()
    }

    /// Mean distance between same-index corners of two quads.
    pub fn average_corner_distance(&self, other: &Quad) -> f64 {
        self.corners
            .iter()
            .zip(other.corners.iter())
            .map(|(a, b)| distance(*a, *b))
            .sum::<f64>()
            / 4.0
    }

    pub fn center_bucket(&self, cell_size: f64) -> CenterBucket {
        let c = self.centroid();
        let cell = cell_size.max(1.0);
        CenterBucket {
            col: (c.x / cell).floor() as i64,
            row: (c.y / cell).floor() as i64,
        }
    }
}

impl From<[Point; 4]> for Quad {
    fn from(points: [Point; 4]) -> Self {
        Quad::new(points)
    }
}

impl From<Quad> for [Point; 4] {
    fn from(quad: Quad) -> Self {
        quad.corners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn p(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn orders_shuffled_rectangle() {
        let quad = Quad::new([p(100.0, 50.0), p(0.0, 50.0), p(100.0, 0.0), p(0.0, 0.0)]);
        assert_eq!(
            quad.corners(),
            [p(0.0, 0.0), p(100.0, 0.0), p(100.0, 50.0), p(0.0, 50.0)]
        );
    }

    #[test]
    fn ordering_is_idempotent() {
        let skewed = [p(12.0, 30.0), p(220.0, 8.0), p(240.0, 190.0), p(5.0, 170.0)];
        let once = order_corners(skewed);
        let twice = order_corners(once);
        assert_eq!(once, twice);
        assert_eq!(Quad::new(once).corners(), once);
    }

    #[test]
    fn ordering_does_not_depend_on_input_order() {
        let base = [p(12.0, 30.0), p(220.0, 8.0), p(240.0, 190.0), p(5.0, 170.0)];
        let expected = order_corners(base);
        let mut rotated = base;
        for _ in 0..4 {
            rotated.rotate_left(1);
            assert_eq!(order_corners(rotated), expected);
        }
        let mut reversed = base;
        reversed.reverse();
        assert_eq!(order_corners(reversed), expected);
    }

    #[test]
    fn area_and_aspect_of_rectangle() {
        let quad = Quad::axis_aligned(10.0, 20.0, 300.0, 200.0);
        assert_relative_eq!(quad.area(), 60_000.0);
        assert_relative_eq!(quad.aspect_ratio(), 1.5);
        assert_relative_eq!(quad.width(), 300.0);
        assert_relative_eq!(quad.height(), 200.0);

        let portrait = Quad::axis_aligned(0.0, 0.0, 200.0, 300.0);
        assert_relative_eq!(portrait.aspect_ratio(), 1.5);
    }

    #[test]
    fn collapsed_quad_is_degenerate() {
        let line = Quad::new([p(0.0, 0.0), p(10.0, 0.0), p(20.0, 0.0), p(30.0, 0.0)]);
        assert!(line.is_degenerate());
        assert!(!Quad::axis_aligned(0.0, 0.0, 10.0, 10.0).is_degenerate());
    }

    #[test]
    fn average_corner_distance_of_shifted_quad() {
        let a = Quad::axis_aligned(0.0, 0.0, 100.0, 100.0);
        let b = Quad::axis_aligned(3.0, 4.0, 100.0, 100.0);
        assert_relative_eq!(a.average_corner_distance(&b), 5.0);
    }

    #[test]
    fn buckets_of_nearby_quads_are_adjacent() {
        let a = Quad::axis_aligned(0.0, 0.0, 100.0, 100.0);
        let b = Quad::axis_aligned(70.0, 0.0, 100.0, 100.0);
        let far = Quad::axis_aligned(400.0, 400.0, 100.0, 100.0);
        assert!(a.center_bucket(80.0).is_adjacent(&b.center_bucket(80.0)));
        assert!(!a.center_bucket(80.0).is_adjacent(&far.center_bucket(80.0)));
    }

    #[test]
    fn serde_restores_canonical_order() {
        let json = r#"[{"x":100.0,"y":50.0},{"x":0.0,"y":0.0},{"x":0.0,"y":50.0},{"x":100.0,"y":0.0}]"#;
        let quad: Quad = serde_json::from_str(json).unwrap();
        assert_eq!(quad.top_left(), p(0.0, 0.0));
        assert_eq!(quad.bottom_right(), p(100.0, 50.0));
    }
}
