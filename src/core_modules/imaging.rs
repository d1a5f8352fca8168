// THEORY:
// The engine never touches pixels directly beyond what this module exposes.
// `ImagingBackend` is the capability surface the detector, calibrator and
// rectifier are written against: grayscale, blur, edge detection, dilation,
// contour extraction, polygon approximation, homography fit, perspective warp
// and quarter-turn rotation. A backend is acquired once per process through
// the engine context and shared behind an `Arc`.
//
// `ImageprocBackend` binds the surface to `image` + `imageproc`. The
// homography fit is a four-point direct linear transform solved with
// `nalgebra`, with Hartley normalization on both point sets so that pixel
// coordinates in the thousands do not wreck the conditioning of the system.

use crate::core_modules::geometry::{self, Point};
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::contours::BorderType;
use imageproc::distance_transform::Norm;
use imageproc::geometric_transformations::warp_into_with;
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

/// Minimum |w| of a projected point before it is treated as at infinity.
const PROJECTIVE_EPSILON: f64 = 1e-12;
/// Smallest triangle area (in normalized units) spanned by any three control
/// points before the fit is refused as near-collinear.
const MIN_NORMALIZED_TRIANGLE_AREA: f64 = 1e-4;

/// One traced border from an edge map.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<Point>,
    /// Hole borders are the inner side of a closed edge band.
    pub is_hole: bool,
    /// Index of the enclosing contour, if any.
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl From<Interpolation> for imageproc::geometric_transformations::Interpolation {
    fn from(value: Interpolation) -> Self {
        match value {
            Interpolation::Nearest => Self::Nearest,
            Interpolation::Bilinear => Self::Bilinear,
            Interpolation::Bicubic => Self::Bicubic,
        }
    }
}

/// How a warp samples the source and what it writes outside of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpOptions {
    pub interpolation: Interpolation,
    pub border: Rgba<u8>,
}

impl Default for WarpOptions {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Bilinear,
            border: Rgba([0, 0, 0, 255]),
        }
    }
}

/// Clockwise quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuarterTurn {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarters,
}

/// A 3x3 projective transform, normalized so that `h[2][2] == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    /// Accepts a matrix if it is finite and projectively scalable.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Option<Self> {
        let scale = matrix[(2, 2)];
        if scale.abs() < PROJECTIVE_EPSILON || !matrix.iter().all(|v| v.is_finite()) {
            return None;
        }
        let matrix = matrix / scale;
        if matrix.determinant().abs() < PROJECTIVE_EPSILON {
            return None;
        }
        Some(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Projects `p`; `None` when it lands on the line at infinity.
    pub fn map_point(&self, p: Point) -> Option<Point> {
        let v = self.matrix * Vector3::new(p.x, p.y, 1.0);
        if v.z.abs() < PROJECTIVE_EPSILON {
            return None;
        }
        Some(Point::new(v.x / v.z, v.y / v.z))
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.matrix.try_inverse().and_then(Homography::from_matrix)
    }

    /// Exact four-point fit mapping `src[i]` onto `dst[i]`.
    pub fn fit(src: &[Point; 4], dst: &[Point; 4]) -> Option<Homography> {
        let (t_src, n_src) = normalize(src)?;
        let (t_dst, n_dst) = normalize(dst)?;
        if has_collinear_triple(&n_src) || has_collinear_triple(&n_dst) {
            return None;
        }

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (s, d)) in n_src.iter().zip(n_dst.iter()).enumerate() {
            let r = 2 * i;
            a[(r, 0)] = s.x;
            a[(r, 1)] = s.y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -d.x * s.x;
            a[(r, 7)] = -d.x * s.y;
            b[r] = d.x;

            a[(r + 1, 3)] = s.x;
            a[(r + 1, 4)] = s.y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -d.y * s.x;
            a[(r + 1, 7)] = -d.y * s.y;
            b[r + 1] = d.y;
        }

        let h = a.lu().solve(&b)?;
        let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        let denormalized = t_dst.try_inverse()? * normalized * t_src;
        Homography::from_matrix(denormalized)
    }
}

/// Translate the centroid to the origin and scale the mean radius to sqrt(2).
fn normalize(points: &[Point; 4]) -> Option<(Matrix3<f64>, [Point; 4])> {
    let c = geometry::centroid(points);
    let mean_radius = points.iter().map(|p| geometry::distance(*p, c)).sum::<f64>() / 4.0;
    if !mean_radius.is_finite() || mean_radius < PROJECTIVE_EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_radius;
    let t = Matrix3::new(s, 0.0, -s * c.x, 0.0, s, -s * c.y, 0.0, 0.0, 1.0);
    Some((t, points.map(|p| Point::new(s * (p.x - c.x), s * (p.y - c.y)))))
}

fn has_collinear_triple(points: &[Point; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES.iter().any(|t| {
        let tri = [points[t[0]], points[t[1]], points[t[2]]];
        geometry::polygon_area(&tri) < MIN_NORMALIZED_TRIANGLE_AREA
    })
}

/// The image-processing capability surface.
pub trait ImagingBackend: Send + Sync {
    fn name(&self) -> &str;
    fn grayscale(&self, frame: &RgbaImage) -> GrayImage;
    /// Gaussian blur with an odd kernel size; sizes <= 1 return the input unchanged.
    fn gaussian_blur(&self, image: &GrayImage, kernel_size: u32) -> GrayImage;
    fn canny(&self, image: &GrayImage, low: f32, high: f32) -> GrayImage;
    fn dilate(&self, image: &GrayImage, radius: u8) -> GrayImage;
    fn find_contours(&self, edges: &GrayImage) -> Vec<Contour>;
    /// Douglas-Peucker simplification. Closed curves come back without a
    /// repeated closing vertex.
    fn approximate_polygon(&self, contour: &[Point], epsilon: f64, closed: bool) -> Vec<Point>;
    fn contour_area(&self, contour: &[Point]) -> f64;
    fn arc_length(&self, contour: &[Point], closed: bool) -> f64;
    fn find_homography(&self, src: &[Point; 4], dst: &[Point; 4]) -> Option<Homography>;
    /// Warps `src` into a `width` x `height` buffer; `None` if the transform is singular.
    fn warp_perspective(
        &self,
        src: &RgbaImage,
        homography: &Homography,
        width: u32,
        height: u32,
        options: &WarpOptions,
    ) -> Option<RgbaImage>;
    fn rotate(&self, image: &RgbaImage, turn: QuarterTurn) -> RgbaImage;
}

/// `ImagingBackend` over the `image` and `imageproc` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageprocBackend;

impl ImageprocBackend {
    /// OpenCV's rule for deriving sigma from a kernel size.
    fn sigma_for_kernel(kernel_size: u32) -> f32 {
        0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
    }
}

type IntPoint = imageproc::point::Point<i32>;

fn to_points(curve: Vec<IntPoint>) -> Vec<Point> {
    curve
        .into_iter()
        .map(|p| Point::new(p.x as f64, p.y as f64))
        .collect()
}

impl ImagingBackend for ImageprocBackend {
    fn name(&self) -> &str {
        "imageproc"
    }

    fn grayscale(&self, frame: &RgbaImage) -> GrayImage {
        image::imageops::grayscale(frame)
    }

    fn gaussian_blur(&self, image: &GrayImage, kernel_size: u32) -> GrayImage {
        if kernel_size <= 1 {
            return image.clone();
        }
        let sigma = Self::sigma_for_kernel(kernel_size).max(0.1);
        imageproc::filter::gaussian_blur_f32(image, sigma)
    }

    fn canny(&self, image: &GrayImage, low: f32, high: f32) -> GrayImage {
        imageproc::edges::canny(image, low, high)
    }

    fn dilate(&self, image: &GrayImage, radius: u8) -> GrayImage {
        if radius == 0 {
            return image.clone();
        }
        imageproc::morphology::dilate(image, Norm::LInf, radius)
    }

    fn find_contours(&self, edges: &GrayImage) -> Vec<Contour> {
        imageproc::contours::find_contours::<i32>(edges)
            .into_iter()
            .map(|c| Contour {
                points: to_points(c.points),
                is_hole: c.border_type == BorderType::Hole,
                parent: c.parent,
            })
            .collect()
    }

    fn approximate_polygon(&self, contour: &[Point], epsilon: f64, closed: bool) -> Vec<Point> {
        if contour.len() < 3 || epsilon <= 0.0 {
            return contour.to_vec();
        }
        let curve: Vec<IntPoint> = contour
            .iter()
            .map(|p| IntPoint::new(p.x.round() as i32, p.y.round() as i32))
            .collect();
        if !closed {
            return to_points(imageproc::geometry::approximate_polygon_dp(
                &curve, epsilon, false,
            ));
        }

        // Split the ring at two mutually distant points and simplify each half
        // as an open chain, so the result does not depend on where the trace began.
        let farthest_from = |origin: usize| {
            (0..contour.len())
                .max_by(|&i, &j| {
                    geometry::distance(contour[origin], contour[i])
                        .total_cmp(&geometry::distance(contour[origin], contour[j]))
                })
                .unwrap_or(origin)
        };
        let a = farthest_from(0);
        let b = farthest_from(a);
        if a == b {
            return vec![contour[a]];
        }
        let n = curve.len();
        let chain = |from: usize, to: usize| {
            let len = (to + n - from) % n + 1;
            (0..len).map(|k| curve[(from + k) % n]).collect::<Vec<_>>()
        };
        let mut ring = imageproc::geometry::approximate_polygon_dp(&chain(a, b), epsilon, false);
        let back = imageproc::geometry::approximate_polygon_dp(&chain(b, a), epsilon, false);
        if back.len() > 2 {
            ring.extend_from_slice(&back[1..back.len() - 1]);
        }
        to_points(ring)
    }

    fn contour_area(&self, contour: &[Point]) -> f64 {
        geometry::polygon_area(contour)
    }

    fn arc_length(&self, contour: &[Point], closed: bool) -> f64 {
        let arc: Vec<imageproc::point::Point<f64>> = contour
            .iter()
            .map(|p| imageproc::point::Point::new(p.x, p.y))
            .collect();
        imageproc::geometry::arc_length(&arc, closed)
    }

    fn find_homography(&self, src: &[Point; 4], dst: &[Point; 4]) -> Option<Homography> {
        Homography::fit(src, dst)
    }

    fn warp_perspective(
        &self,
        src: &RgbaImage,
        homography: &Homography,
        width: u32,
        height: u32,
        options: &WarpOptions,
    ) -> Option<RgbaImage> {
        if width == 0 || height == 0 {
            return None;
        }
        // warp_into_with maps output coordinates back into the source.
        let back = *homography.inverse()?.matrix();
        let mut out = RgbaImage::new(width, height);
        warp_into_with(
            src,
            move |x, y| {
                let v = back * Vector3::new(x as f64, y as f64, 1.0);
                if v.z.abs() < PROJECTIVE_EPSILON {
                    (-1.0, -1.0)
                } else {
                    ((v.x / v.z) as f32, (v.y / v.z) as f32)
                }
            },
            options.interpolation.into(),
            options.border,
            &mut out,
        );
        Some(out)
    }

    fn rotate(&self, image: &RgbaImage, turn: QuarterTurn) -> RgbaImage {
        match turn {
            QuarterTurn::None => image.clone(),
            QuarterTurn::Quarter => image::imageops::rotate90(image),
            QuarterTurn::Half => image::imageops::rotate180(image),
            QuarterTurn::ThreeQuarters => image::imageops::rotate270(image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Luma;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> [Point; 4] {
        [
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ]
    }

    #[test]
    fn rectangle_onto_itself_is_identity() {
        let r = rect(0.0, 0.0, 320.0, 240.0);
        let h = Homography::fit(&r, &r).unwrap();
        let identity = Matrix3::<f64>::identity();
        for (a, b) in h.matrix().iter().zip(identity.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn fit_maps_every_control_point() {
        let src = [
            Point::new(31.0, 17.0),
            Point::new(402.0, 44.0),
            Point::new(380.0, 301.0),
            Point::new(12.0, 260.0),
        ];
        let dst = rect(0.0, 0.0, 380.0, 250.0);
        let h = Homography::fit(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let m = h.map_point(*s).unwrap();
            assert_abs_diff_eq!(m.x, d.x, epsilon = 1e-6);
            assert_abs_diff_eq!(m.y, d.y, epsilon = 1e-6);
        }
        let back = h.inverse().unwrap();
        let m = back.map_point(dst[2]).unwrap();
        assert_abs_diff_eq!(m.x, src[2].x, epsilon = 1e-6);
        assert_abs_diff_eq!(m.y, src[2].y, epsilon = 1e-6);
    }

    #[test]
    fn collinear_points_do_not_fit() {
        let src = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
            Point::new(0.0, 10.0),
        ];
        assert!(Homography::fit(&src, &rect(0.0, 0.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn translation_warp_moves_pixels() {
        let mut src = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 255]));
        src.put_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let from = rect(5.0, 5.0, 10.0, 10.0);
        let to = rect(0.0, 0.0, 10.0, 10.0);
        let h = Homography::fit(&from, &to).unwrap();
        let options = WarpOptions {
            interpolation: Interpolation::Nearest,
            ..WarpOptions::default()
        };
        let out = ImageprocBackend
            .warp_perspective(&src, &h, 10, 10, &options)
            .unwrap();
        assert_eq!(out.dimensions(), (10, 10));
        assert_eq!(out.get_pixel(5, 5), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn filled_square_traces_to_four_corners() {
        let mut img = GrayImage::new(60, 60);
        for y in 10..50 {
            for x in 10..50 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let backend = ImageprocBackend;
        let contours = backend.find_contours(&img);
        let outer = contours.iter().find(|c| !c.is_hole).unwrap();
        let perimeter = backend.arc_length(&outer.points, true);
        let poly = backend.approximate_polygon(&outer.points, 0.02 * perimeter, true);
        assert_eq!(poly.len(), 4);
        assert_abs_diff_eq!(backend.contour_area(&poly), 39.0 * 39.0, epsilon = 1.0);
    }

    #[test]
    fn approximation_ignores_trace_start() {
        let square = rect(0.0, 0.0, 40.0, 40.0);
        let mut ring = Vec::new();
        for i in 0..4 {
            let (a, b) = (square[i], square[(i + 1) % 4]);
            for k in 0..40 {
                let t = k as f64 / 40.0;
                ring.push(Point::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t));
            }
        }
        // Start the trace mid-edge.
        ring.rotate_left(20);
        let poly = ImageprocBackend.approximate_polygon(&ring, 3.0, true);
        assert_eq!(poly.len(), 4);
        assert_abs_diff_eq!(geometry::polygon_area(&poly), 1600.0, epsilon = 1e-9);
    }

    #[test]
    fn half_turn_swaps_corners() {
        let mut img = RgbaImage::from_pixel(4, 2, Rgba([0, 0, 0, 255]));
        img.put_pixel(0, 0, Rgba([9, 9, 9, 255]));
        let turned = ImageprocBackend.rotate(&img, QuarterTurn::Half);
        assert_eq!(turned.get_pixel(3, 1), &Rgba([9, 9, 9, 255]));
    }
}
