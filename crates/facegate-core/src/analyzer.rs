//! The detector/extractor component the scan loop depends on.
//!
//! Model loading is explicit: callers invoke [`FaceAnalyzer::ensure_initialized`]
//! before the first frame. It is idempotent, so one analyzer can be shared by
//! every scan session of a process and pays the load cost once.

use crate::detector::{best_candidate, DetectorError, FaceDetector};
use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::landmarks::{LandmarkError, LandmarkModel};
use crate::models::{ModelError, ModelPaths};
use crate::types::{Descriptor, FaceObservation};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("models not initialized")]
    NotInitialized,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Landmarks(#[from] LandmarkError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
}

/// Face detection, landmarking, and descriptor extraction on grayscale frames.
pub trait FaceAnalyzer: Send {
    /// Load whatever the analyzer needs. Safe to call repeatedly.
    fn ensure_initialized(&mut self) -> Result<(), AnalyzerError>;

    fn is_initialized(&self) -> bool;

    /// Best face candidate in the frame; `Ok(None)` when there is none.
    fn analyze(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Option<FaceObservation>, AnalyzerError>;

    fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &FaceObservation,
    ) -> Result<Descriptor, AnalyzerError>;
}

struct Loaded {
    detector: FaceDetector,
    landmarks: LandmarkModel,
    extractor: DescriptorExtractor,
}

/// ONNX Runtime implementation: SCRFD + 1k3d68 + ArcFace.
pub struct OnnxAnalyzer {
    paths: ModelPaths,
    verify_checksums: bool,
    loaded: Option<Loaded>,
}

impl OnnxAnalyzer {
    /// Nothing is loaded until [`FaceAnalyzer::ensure_initialized`].
    pub fn new(paths: ModelPaths, verify_checksums: bool) -> Self {
        Self {
            paths,
            verify_checksums,
            loaded: None,
        }
    }

    fn loaded(&mut self) -> Result<&mut Loaded, AnalyzerError> {
        self.loaded.as_mut().ok_or(AnalyzerError::NotInitialized)
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn ensure_initialized(&mut self) -> Result<(), AnalyzerError> {
        if self.loaded.is_some() {
            return Ok(());
        }

        self.paths.check(self.verify_checksums)?;
        let loaded = Loaded {
            detector: FaceDetector::load(&self.paths.detector)?,
            landmarks: LandmarkModel::load(&self.paths.landmarks)?,
            extractor: DescriptorExtractor::load(&self.paths.recognizer)?,
        };
        self.loaded = Some(loaded);
        tracing::info!(verified = self.verify_checksums, "face models initialized");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.loaded.is_some()
    }

    fn analyze(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Option<FaceObservation>, AnalyzerError> {
        let models = self.loaded()?;
        let faces = models.detector.detect(pixels, width, height)?;
        let Some(bbox) = best_candidate(faces) else {
            return Ok(None);
        };
        let landmarks = models.landmarks.predict(pixels, width, height, &bbox)?;
        Ok(Some(FaceObservation { bbox, landmarks }))
    }

    fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &FaceObservation,
    ) -> Result<Descriptor, AnalyzerError> {
        let models = self.loaded()?;
        Ok(models.extractor.extract(pixels, width, height, face)?)
    }
}
