//! Liveness-gated face scanning: detection, landmarks, descriptors, and the scan state machine.
//!
//! Pure scan logic (liveness signal, state machine, attempt limiter, matcher)
//! plus the ONNX models behind the [`FaceAnalyzer`] seam: SCRFD detection,
//! 68-point landmarks, and ArcFace descriptors, all on CPU.

pub mod alignment;
pub mod analyzer;
pub mod attempts;
pub mod detector;
pub mod extractor;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod models;
pub mod scan;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use attempts::{AttemptLimiter, AttemptVerdict};
pub use liveness::{LivenessReading, LivenessSignal};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use models::ModelPaths;
pub use scan::{
    FailureReason, FrameObservation, Phase, Resolution, ScanConfig, ScanError, ScanEvent,
    ScanMachine, ScanSnapshot, ScanState, ValidationOutcome,
};
pub use types::{BoundingBox, Descriptor, Enrollment, FaceObservation, Landmarks, Point};
