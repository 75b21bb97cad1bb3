//! 68-point landmark regression via ONNX Runtime (insightface `1k3d68`).
//!
//! The face box is cropped to a 192×192 square at 1.5× its longest side,
//! the model regresses normalised coordinates, and the points are mapped back
//! into frame space.

use crate::alignment::{warp, Similarity};
use crate::types::{BoundingBox, Landmarks, Point, LANDMARK_COUNT};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 192;
const CROP_SCALE: f32 = 1.5;
/// Outputs at least this long carry (x, y, z) triples; shorter ones (x, y).
const THREE_D_OUTPUT_LEN: usize = 3000;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("landmark model not found: {0}")]
    ModelNotFound(String),
    #[error("landmark inference failed: {0}")]
    InferenceFailed(String),
    #[error("degenerate face box")]
    DegenerateBox,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct LandmarkModel {
    session: Session,
}

impl LandmarkModel {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );
        Ok(Self { session })
    }

    pub fn predict(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Landmarks, LandmarkError> {
        let to_crop = crop_transform(face).ok_or(LandmarkError::DegenerateBox)?;
        let to_frame = to_crop.inverse().ok_or(LandmarkError::DegenerateBox)?;

        let crop = warp(
            pixels,
            width as usize,
            height as usize,
            &to_crop,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
        );
        let input = to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(e.to_string()))?;

        decode(raw, &to_frame)
    }
}

/// Frame-to-crop transform centring the box in the model input.
fn crop_transform(face: &BoundingBox) -> Option<Similarity> {
    let side = face.width.max(face.height);
    if !side.is_finite() || side <= 1.0 {
        return None;
    }
    let scale = LANDMARK_INPUT_SIZE as f32 / (side * CROP_SCALE);
    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    let center = face.center();
    Some(Similarity::scale_translate(
        scale,
        half - scale * center.x,
        half - scale * center.y,
    ))
}

/// Raw pixel values replicated into three channels; the model normalises internally.
fn to_tensor(crop: &[u8]) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        crop.get(y * size + x).copied().unwrap_or(0) as f32
    })
}

/// Keep the trailing 68 points, undo the [-1, 1] normalisation, map to the frame.
fn decode(raw: &[f32], to_frame: &Similarity) -> Result<Landmarks, LandmarkError> {
    let dims = if raw.len() >= THREE_D_OUTPUT_LEN { 3 } else { 2 };
    let needed = LANDMARK_COUNT * dims;
    if raw.len() < needed || raw.len() % dims != 0 {
        return Err(LandmarkError::InferenceFailed(format!(
            "unexpected landmark output length {}",
            raw.len()
        )));
    }

    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    let points = raw[raw.len() - needed..]
        .chunks_exact(dims)
        .map(|v| to_frame.apply(Point::new((v[0] + 1.0) * half, (v[1] + 1.0) * half)))
        .collect();

    Landmarks::new(points).ok_or_else(|| LandmarkError::InferenceFailed("wrong landmark count".into()))
}
