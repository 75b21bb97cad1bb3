//! Nearest-enrollment matching of a captured descriptor.

use crate::types::{Descriptor, Enrollment};

/// Acceptance distance for L2-normalised ArcFace descriptors.
///
/// For unit vectors `d^2 = 2 - 2cos`, so 1.10 corresponds to a cosine
/// similarity of about 0.40.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.10;

/// Distances closer than this are treated as the same distance.
const TIE_EPSILON: f32 = 1e-6;

/// Result of comparing a probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest usable enrollment; infinite when none was comparable.
    pub distance: f32,
    pub enrollment_id: Option<String>,
    pub user: Option<String>,
}

impl MatchResult {
    fn rejected(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            enrollment_id: None,
            user: None,
        }
    }
}

/// Strategy for comparing a probe descriptor against enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, gallery: &[Enrollment]) -> MatchResult;
}

/// Euclidean nearest-match under a distance threshold.
///
/// Every gallery entry is visited; there is no early exit on a good match.
/// An enrollment equally close to the probe as the nearest one makes the
/// decision ambiguous and is reported as no match.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, gallery: &[Enrollment]) -> MatchResult {
        let mut best = f32::INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut tied = false;

        for (i, enrollment) in gallery.iter().enumerate() {
            if !enrollment.is_usable() || enrollment.descriptor.len() != probe.len() {
                continue;
            }
            let distance = probe.euclidean_distance(&enrollment.descriptor);
            if !distance.is_finite() {
                continue;
            }
            if (distance - best).abs() <= TIE_EPSILON {
                tied = true;
            } else if distance < best {
                best = distance;
                best_idx = Some(i);
                tied = false;
            }
        }

        match best_idx {
            Some(idx) if best < self.threshold && !tied => MatchResult {
                matched: true,
                distance: best,
                enrollment_id: Some(gallery[idx].id.clone()),
                user: Some(gallery[idx].user.clone()),
            },
            Some(_) if tied => {
                tracing::warn!(distance = best, "ambiguous match: two enrollments equally close");
                MatchResult::rejected(best)
            }
            _ => MatchResult::rejected(best),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(id: &str, values: Vec<f32>) -> Enrollment {
        Enrollment {
            id: id.into(),
            user: format!("user-{id}"),
            descriptor: Descriptor::new(values),
            active: true,
            enrolled_at: String::new(),
            last_login_at: None,
        }
    }

    #[test]
    fn test_nearest_under_threshold_matches() {
        let probe = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            enrollment("1", vec![0.0, 1.0, 0.0]),
            enrollment("2", vec![0.0, 0.0, 1.0]),
            enrollment("3", vec![0.9, 0.1, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(result.matched);
        assert_eq!(result.enrollment_id.as_deref(), Some("3"));
        assert_eq!(result.user.as_deref(), Some("user-3"));
        assert!(result.distance < 0.2);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![enrollment("1", vec![1.0, 0.0])];
        assert!(!EuclideanMatcher::new(1.0).compare(&probe, &gallery).matched);
        assert!(EuclideanMatcher::new(1.01).compare(&probe, &gallery).matched);
    }

    #[test]
    fn test_far_probe_reports_distance_without_match() {
        let probe = Descriptor::new(vec![1.0, 0.0]);
        let gallery = vec![enrollment("1", vec![-1.0, 0.0])];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(!result.matched);
        assert!((result.distance - 2.0).abs() < 1e-6);
        assert!(result.enrollment_id.is_none());
    }

    #[test]
    fn test_equal_distance_is_ambiguous() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![
            enrollment("1", vec![0.3, 0.0]),
            enrollment("2", vec![0.0, 0.3]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(!result.matched);
        assert!((result.distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_closer_entry_after_tie_clears_it() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![
            enrollment("1", vec![0.5, 0.0]),
            enrollment("2", vec![0.0, 0.5]),
            enrollment("3", vec![0.1, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(result.matched);
        assert_eq!(result.enrollment_id.as_deref(), Some("3"));
    }

    #[test]
    fn test_skips_inactive_and_mismatched_entries() {
        let probe = Descriptor::new(vec![1.0, 0.0]);
        let mut inactive = enrollment("1", vec![1.0, 0.0]);
        inactive.active = false;
        let gallery = vec![
            inactive,
            enrollment("2", vec![1.0, 0.0, 0.0]),
            enrollment("3", vec![]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(!result.matched);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_empty_gallery() {
        let result = EuclideanMatcher::default().compare(&Descriptor::new(vec![1.0]), &[]);
        assert!(!result.matched);
    }
}
