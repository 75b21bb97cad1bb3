//! Scripted camera and analyzer for scan tests.

use facegate_core::analyzer::AnalyzerError;
use facegate_core::extractor::ExtractorError;
use facegate_core::models::ModelError;
use facegate_core::types::LANDMARK_COUNT;
use facegate_core::{BoundingBox, Descriptor, FaceAnalyzer, FaceObservation, Landmarks, Point};
use facegate_hw::{CameraError, Frame, FrameSource};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared view of a [`FakeSource`] that survives it being moved to the worker.
#[derive(Clone, Default)]
pub struct SourceTracker {
    pub grabs: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
    pub opened: Arc<AtomicBool>,
}

pub struct FakeSource {
    tracker: SourceTracker,
    dark: bool,
    fail_after: Option<usize>,
    fail_once_at: Option<usize>,
}

pub fn fake_source() -> (FakeSource, SourceTracker) {
    let tracker = SourceTracker::default();
    let source = FakeSource {
        tracker: tracker.clone(),
        dark: false,
        fail_after: None,
        fail_once_at: None,
    };
    (source, tracker)
}

impl FakeSource {
    pub fn dark(mut self) -> Self {
        self.dark = true;
        self
    }

    pub fn failing_after(mut self, grabs: usize) -> Self {
        self.fail_after = Some(grabs);
        self
    }

    /// A single failed grab at index `grab`; later grabs succeed.
    pub fn failing_once_at(mut self, grab: usize) -> Self {
        self.fail_once_at = Some(grab);
        self
    }
}

impl FrameSource for FakeSource {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let n = self.tracker.grabs.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| n >= limit) || self.fail_once_at == Some(n) {
            return Err(CameraError::CaptureFailed("unplugged".into()));
        }
        let level = if self.dark { 0 } else { 128 };
        Ok(Frame::from_gray(vec![level; 64], 8, 8, n as u32))
    }

    fn resolution(&self) -> (u32, u32) {
        (8, 8)
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.tracker.released.store(true, Ordering::SeqCst);
    }
}

/// Plays back a script of per-frame eye aspect ratios; `None` and an
/// exhausted script both mean "no face".
pub struct FakeAnalyzer {
    script: VecDeque<Option<f32>>,
    fail_init: bool,
    fail_extract: bool,
    init_delay: Duration,
    initialized: bool,
    pub init_calls: usize,
}

impl FakeAnalyzer {
    pub const DESCRIPTOR: [f32; 4] = [0.5, 0.5, 0.5, 0.5];

    pub fn scripted(script: impl IntoIterator<Item = Option<f32>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fail_init: false,
            fail_extract: false,
            init_delay: Duration::ZERO,
            initialized: false,
            init_calls: 0,
        }
    }

    /// `n` frames of a face with eyes open.
    pub fn open_eyes(n: usize) -> Self {
        Self::scripted(std::iter::repeat(Some(0.32)).take(n))
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Model loading that blocks the worker thread for `delay`.
    pub fn slow_init(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn failing_extract(mut self) -> Self {
        self.fail_extract = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

/// Landmarks whose eyes have the given aspect ratio.
pub fn landmarks_with_ear(ear: f32) -> Landmarks {
    let half_gap = ear * 5.0;
    let contour = |x: f32, y: f32| {
        [
            Point::new(x, y),
            Point::new(x + 3.0, y - half_gap),
            Point::new(x + 7.0, y - half_gap),
            Point::new(x + 10.0, y),
            Point::new(x + 7.0, y + half_gap),
            Point::new(x + 3.0, y + half_gap),
        ]
    };
    let mut points = vec![Point::new(30.0, 50.0); LANDMARK_COUNT];
    points[36..42].copy_from_slice(&contour(10.0, 20.0));
    points[42..48].copy_from_slice(&contour(40.0, 20.0));
    Landmarks::new(points).expect("68 points")
}

impl FaceAnalyzer for FakeAnalyzer {
    fn ensure_initialized(&mut self) -> Result<(), AnalyzerError> {
        self.init_calls += 1;
        std::thread::sleep(self.init_delay);
        if self.fail_init {
            return Err(AnalyzerError::Model(ModelError::Missing {
                name: "det_10g.onnx",
                path: PathBuf::from("/nonexistent/det_10g.onnx"),
            }));
        }
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn analyze(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Option<FaceObservation>, AnalyzerError> {
        let Some(Some(ear)) = self.script.pop_front() else {
            return Ok(None);
        };
        Ok(Some(FaceObservation {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 60.0,
                height: 60.0,
                confidence: 0.9,
                keypoints: None,
            },
            landmarks: landmarks_with_ear(ear),
        }))
    }

    fn extract(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _face: &FaceObservation,
    ) -> Result<Descriptor, AnalyzerError> {
        if self.fail_extract {
            return Err(AnalyzerError::Extractor(ExtractorError::AlignmentFailed));
        }
        Ok(Descriptor::new(Self::DESCRIPTOR.to_vec()))
    }
}
