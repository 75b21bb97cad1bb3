//! Eye-openness liveness signal.
//!
//! Scores each frame with an eye aspect ratio (EAR) computed from the two
//! six-point eye contours and classifies the eyes as open above a fixed
//! threshold. The scan state machine turns a sustained run of open-eye frames
//! into its liveness proof.
//!
//! # Threat Coverage
//!
//! - **Blocks:** a subject whose eyes are closed or not visible.
//! - **Does not block:** a printed photograph or screen showing open eyes, or a
//!   looping video. There is no texture, depth, or challenge-response check.

use crate::types::{Landmarks, Point};

/// EAR above which eyes count as open. Empirical: open eyes on the 68-point
/// layout sit around 0.28-0.35, a closed lid drops below 0.15.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.22;

/// Eye aspect ratio of a single six-point contour:
/// `(|p2-p6| + |p3-p5|) / (2 * |p1-p4|)`.
///
/// Returns 0.0 when the horizontal extent is degenerate.
pub fn eye_aspect_ratio(contour: &[Point; 6]) -> f32 {
    let [p1, p2, p3, p4, p5, p6] = contour;
    let horizontal = p1.distance(p4);
    if horizontal < 1e-6 {
        return 0.0;
    }
    (p2.distance(p6) + p3.distance(p5)) / (2.0 * horizontal)
}

/// Mean EAR across both eyes.
pub fn openness(landmarks: &Landmarks) -> f32 {
    let left = eye_aspect_ratio(&landmarks.left_eye());
    let right = eye_aspect_ratio(&landmarks.right_eye());
    (left + right) / 2.0
}

/// Liveness score of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessReading {
    pub ear: f32,
    pub eyes_open: bool,
}

/// Threshold classifier over the EAR openness score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessSignal {
    threshold: f32,
}

impl Default for LivenessSignal {
    fn default() -> Self {
        Self::new(DEFAULT_EAR_THRESHOLD)
    }
}

impl LivenessSignal {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn classify(&self, landmarks: &Landmarks) -> LivenessReading {
        self.classify_ratio(openness(landmarks))
    }

    /// Non-finite ratios never count as open.
    pub fn classify_ratio(&self, ear: f32) -> LivenessReading {
        LivenessReading {
            ear,
            eyes_open: ear.is_finite() && ear > self.threshold,
        }
    }
}
