//! ArcFace descriptor extraction via ONNX Runtime.
//!
//! Aligns the face onto the 112×112 template and produces an L2-normalised
//! 512-dimensional descriptor (insightface `w600k_r50`).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Descriptor, FaceObservation};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
// Symmetric normalisation, unlike SCRFD's 128.0.
const ARCFACE_STD: f32 = 127.5;
pub const DESCRIPTOR_DIM: usize = 512;
pub const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("face keypoints are degenerate; cannot align")]
    AlignmentFailed,
    #[error("extraction failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct DescriptorExtractor {
    session: Session,
}

impl DescriptorExtractor {
    pub fn load(model_path: &Path) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );
        Ok(Self { session })
    }

    pub fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &FaceObservation,
    ) -> Result<Descriptor, ExtractorError> {
        let aligned = alignment::align_face(pixels, width, height, &face.alignment_points())
            .ok_or(ExtractorError::AlignmentFailed)?;
        let input = to_tensor(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("descriptor output: {e}")))?;

        normalize(raw)
    }
}

fn to_tensor(aligned: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
        let pixel = aligned.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
        (pixel - ARCFACE_MEAN) / ARCFACE_STD
    })
}

/// Validate dimension and finiteness, then scale to unit length.
fn normalize(raw: &[f32]) -> Result<Descriptor, ExtractorError> {
    if raw.len() != DESCRIPTOR_DIM {
        return Err(ExtractorError::InferenceFailed(format!(
            "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
            raw.len()
        )));
    }
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return Err(ExtractorError::InferenceFailed("descriptor has no magnitude".into()));
    }

    Ok(Descriptor {
        values: raw.iter().map(|v| v / norm).collect(),
        model_version: Some(MODEL_VERSION.to_string()),
    })
}
