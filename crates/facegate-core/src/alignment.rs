//! Similarity transforms and bilinear warping.
//!
//! Used twice per capture: to crop a square region around a detected face for
//! the landmark model, and to align a face onto the canonical 112×112 ArcFace
//! template before descriptor extraction.

use crate::types::Point;

/// ArcFace reference keypoints for a 112×112 crop.
pub const ARCFACE_TEMPLATE: [Point; 5] = [
    Point::new(38.2946, 51.6963), // left eye
    Point::new(73.5318, 51.5014), // right eye
    Point::new(56.0252, 71.7366), // nose
    Point::new(41.5493, 92.3655), // left mouth
    Point::new(70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// 4-DOF similarity transform (uniform scale, rotation, translation):
///
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Pure scale about the origin followed by a translation.
    pub fn scale_translate(scale: f32, tx: f32, ty: f32) -> Self {
        Self { a: scale, b: 0.0, tx, ty }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    /// `None` when the transform collapses the plane.
    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    /// Least-squares similarity mapping `src` onto `dst`.
    ///
    /// Closed form: after centring both point sets,
    /// `a = Σ(s·d) / Σ|s|²` and `b = Σ(s×d) / Σ|s|²`.
    /// Returns `None` for fewer than two points or coincident sources.
    pub fn estimate(src: &[Point], dst: &[Point]) -> Option<Similarity> {
        if src.len() != dst.len() || src.len() < 2 {
            return None;
        }
        let sc = Point::centroid(src);
        let dc = Point::centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (s, d) in src.iter().zip(dst) {
            let (sx, sy) = (s.x - sc.x, s.y - sc.y);
            let (dx, dy) = (d.x - dc.x, d.y - dc.y);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Similarity {
            a,
            b,
            tx: dc.x - (a * sc.x - b * sc.y),
            ty: dc.y - (b * sc.x + a * sc.y),
        })
    }
}

/// Bilinear sample of a grayscale image; pixels outside the image read as 0.
pub fn sample_bilinear(pixels: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let at = |px: i64, py: i64| -> f32 {
        if px >= 0 && py >= 0 && (px as usize) < width && (py as usize) < height {
            pixels
                .get(py as usize * width + px as usize)
                .copied()
                .unwrap_or(0) as f32
        } else {
            0.0
        }
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Warp a grayscale image into an `out_w`×`out_h` crop, where `to_output`
/// maps source coordinates to crop coordinates.
///
/// A degenerate transform yields an all-black crop.
pub fn warp(
    pixels: &[u8],
    width: usize,
    height: usize,
    to_output: &Similarity,
    out_w: usize,
    out_h: usize,
) -> Vec<u8> {
    let Some(to_source) = to_output.inverse() else {
        return vec![0; out_w * out_h];
    };

    let mut out = Vec::with_capacity(out_w * out_h);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let src = to_source.apply(Point::new(ox as f32, oy as f32));
            let value = sample_bilinear(pixels, width, height, src.x, src.y);
            out.push(value.round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}

/// Align a face onto the 112×112 ArcFace template using its five keypoints.
///
/// Returns `None` when the keypoints are degenerate.
pub fn align_face(pixels: &[u8], width: u32, height: u32, keypoints: &[Point; 5]) -> Option<Vec<u8>> {
    let transform = Similarity::estimate(keypoints, &ARCFACE_TEMPLATE)?;
    Some(warp(
        pixels,
        width as usize,
        height as usize,
        &transform,
        ALIGNED_SIZE,
        ALIGNED_SIZE,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() < 1e-3 && (a.y - b.y).abs() < 1e-3
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&ARCFACE_TEMPLATE, &ARCFACE_TEMPLATE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-5, "a = {}", t.a);
        assert!(t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_recovers_known_transform() {
        // 30 degrees, scale 0.5, shifted
        let truth = Similarity {
            a: 0.5 * 30f32.to_radians().cos(),
            b: 0.5 * 30f32.to_radians().sin(),
            tx: 12.0,
            ty: -4.0,
        };
        let src: Vec<Point> = ARCFACE_TEMPLATE.iter().map(|p| Point::new(p.x * 3.0, p.y * 2.0 + 7.0)).collect();
        let dst: Vec<Point> = src.iter().map(|&p| truth.apply(p)).collect();

        let t = Similarity::estimate(&src, &dst).unwrap();
        assert!((t.a - truth.a).abs() < 1e-4);
        assert!((t.b - truth.b).abs() < 1e-4);
        assert!((t.tx - truth.tx).abs() < 1e-2);
        assert!((t.ty - truth.ty).abs() < 1e-2);
    }

    #[test]
    fn test_estimate_rejects_degenerate() {
        let same = [Point::new(5.0, 5.0); 5];
        assert!(Similarity::estimate(&same, &ARCFACE_TEMPLATE).is_none());
        assert!(Similarity::estimate(&same[..1], &ARCFACE_TEMPLATE[..1]).is_none());
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Similarity { a: 0.8, b: -0.3, tx: 5.0, ty: 9.0 };
        let inv = t.inverse().unwrap();
        let p = Point::new(17.0, -3.5);
        assert!(close(inv.apply(t.apply(p)), p));
        assert!(Similarity { a: 0.0, b: 0.0, tx: 1.0, ty: 1.0 }.inverse().is_none());
    }

    #[test]
    fn test_sample_bilinear_midpoint() {
        let img = [0u8, 100, 200, 50];
        assert!((sample_bilinear(&img, 2, 2, 0.5, 0.0) - 50.0).abs() < 1e-4);
        assert_eq!(sample_bilinear(&img, 2, 2, -5.0, -5.0), 0.0);
    }

    #[test]
    fn test_warp_identity_copies() {
        let img: Vec<u8> = (0..16).collect();
        let out = warp(&img, 4, 4, &Similarity::IDENTITY, 4, 4);
        assert_eq!(out, img);
    }

    #[test]
    fn test_align_face_moves_keypoint_to_template() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];
        let keypoints = [
            Point::new(80.0, 60.0),
            Point::new(120.0, 60.0),
            Point::new(100.0, 85.0),
            Point::new(85.0, 110.0),
            Point::new(115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                frame[(58 + dy) * w + 78 + dx] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &keypoints).unwrap();
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);

        let (rx, ry) = (ARCFACE_TEMPLATE[0].x.round() as usize, ARCFACE_TEMPLATE[0].y.round() as usize);
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap();
        assert!(peak > 100, "left eye patch not near template, peak = {peak}");
    }
}
