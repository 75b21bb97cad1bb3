use serde::{Deserialize, Serialize};

/// A 2-D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Arithmetic mean of a non-empty point set; origin for an empty one.
    pub fn centroid(points: &[Point]) -> Point {
        if points.is_empty() {
            return Point::default();
        }
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }
}

/// Bounding box for a detected face, with optional detector keypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five detector keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub keypoints: Option<[Point; 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 for disjoint or empty boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Number of points in the iBUG 68-point landmark layout.
pub const LANDMARK_COUNT: usize = 68;

const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const NOSE_TIP: usize = 30;
const MOUTH_LEFT: usize = 48;
const MOUTH_RIGHT: usize = 54;

/// Ordered 68-point facial landmark set (iBUG layout).
///
/// "Left" and "right" are image-relative: `left_eye` is the eye that appears
/// on the left side of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    /// Wrap a point list; `None` unless it holds exactly [`LANDMARK_COUNT`] points.
    pub fn new(points: Vec<Point>) -> Option<Self> {
        (points.len() == LANDMARK_COUNT).then_some(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Six-point contour of the image-left eye, ordered p1..p6
    /// (outer corner, two upper lid points, inner corner, two lower lid points).
    pub fn left_eye(&self) -> [Point; 6] {
        self.contour(LEFT_EYE)
    }

    /// Six-point contour of the image-right eye, same ordering as [`left_eye`](Self::left_eye).
    pub fn right_eye(&self) -> [Point; 6] {
        self.contour(RIGHT_EYE)
    }

    /// Five alignment points in the detector keypoint convention.
    pub fn alignment_points(&self) -> [Point; 5] {
        [
            Point::centroid(&self.points[LEFT_EYE]),
            Point::centroid(&self.points[RIGHT_EYE]),
            self.points[NOSE_TIP],
            self.points[MOUTH_LEFT],
            self.points[MOUTH_RIGHT],
        ]
    }

    fn contour(&self, range: std::ops::Range<usize>) -> [Point; 6] {
        std::array::from_fn(|i| self.points[range.start + i])
    }
}

impl TryFrom<Vec<Point>> for Landmarks {
    type Error = String;

    fn try_from(points: Vec<Point>) -> Result<Self, Self::Error> {
        let len = points.len();
        Landmarks::new(points)
            .ok_or_else(|| format!("expected {LANDMARK_COUNT} landmarks, got {len}"))
    }
}

impl From<Landmarks> for Vec<Point> {
    fn from(landmarks: Landmarks) -> Self {
        landmarks.points
    }
}

/// The single best face candidate found in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
}

impl FaceObservation {
    /// Points used to align the face for descriptor extraction. Detector
    /// keypoints win when present; otherwise they are derived from landmarks.
    pub fn alignment_points(&self) -> [Point; 5] {
        self.bbox
            .keypoints
            .unwrap_or_else(|| self.landmarks.alignment_points())
    }
}

/// Fixed-length face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance. Descriptors of different length are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// A stored enrollment: one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub user: String,
    pub descriptor: Descriptor,
    pub active: bool,
    pub enrolled_at: String,
    pub last_login_at: Option<String>,
}

impl Enrollment {
    /// Usable for authentication only when active and holding a valid descriptor.
    pub fn is_usable(&self) -> bool {
        self.active && !self.descriptor.is_empty() && self.descriptor.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
            keypoints: None,
        }
    }

    fn ramp_landmarks() -> Landmarks {
        let points = (0..LANDMARK_COUNT)
            .map(|i| Point::new(i as f32, (i * 2) as f32))
            .collect();
        Landmarks::new(points).unwrap()
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&bbox(20.0, 20.0, 5.0, 5.0)), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_landmarks_require_68_points() {
        assert!(Landmarks::new(vec![Point::default(); 5]).is_none());
        assert!(Landmarks::new(vec![Point::default(); LANDMARK_COUNT]).is_some());
    }

    #[test]
    fn test_eye_contours_use_ibug_indices() {
        let lm = ramp_landmarks();
        assert_eq!(lm.left_eye()[0], Point::new(36.0, 72.0));
        assert_eq!(lm.left_eye()[5], Point::new(41.0, 82.0));
        assert_eq!(lm.right_eye()[0], Point::new(42.0, 84.0));
    }

    #[test]
    fn test_alignment_points_from_landmarks() {
        let lm = ramp_landmarks();
        let pts = lm.alignment_points();
        // mean of 36..42 = 38.5
        assert!((pts[0].x - 38.5).abs() < 1e-5);
        assert_eq!(pts[2], Point::new(30.0, 60.0));
        assert_eq!(pts[4], Point::new(54.0, 108.0));
    }

    #[test]
    fn test_landmarks_serde_rejects_wrong_length() {
        let json = serde_json::to_string(&vec![Point::default(); 3]).unwrap();
        assert!(serde_json::from_str::<Landmarks>(&json).is_err());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Descriptor::new(vec![0.0, 3.0]);
        let b = Descriptor::new(vec![4.0, 0.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Descriptor::new(vec![0.0, 1.0]);
        let b = Descriptor::new(vec![0.0]);
        assert!(a.euclidean_distance(&b).is_infinite());
    }

    #[test]
    fn test_enrollment_usability() {
        let mut e = Enrollment {
            id: "1".into(),
            user: "admin".into(),
            descriptor: Descriptor::new(vec![0.1, 0.2]),
            active: true,
            enrolled_at: String::new(),
            last_login_at: None,
        };
        assert!(e.is_usable());
        e.active = false;
        assert!(!e.is_usable());
        e.active = true;
        e.descriptor.values.clear();
        assert!(!e.is_usable());
        e.descriptor.values = vec![f32::NAN];
        assert!(!e.is_usable());
    }
}
