//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into a 640×640 input, decodes the three anchor-free
//! stride levels (8, 16, 32) into boxes with five keypoints, and suppresses
//! overlaps with NMS. An empty result is the normal "no face" outcome.

use crate::alignment::{warp, Similarity};
use crate::types::{BoundingBox, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported detector model: {0}")]
    UnsupportedModel(String),
    #[error("detection failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Mapping between frame coordinates and the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    /// Size of the scaled frame inside the input square.
    pub content_w: usize,
    pub content_h: usize,
}

impl Letterbox {
    pub fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width.max(1) as f32).min(input as f32 / height.max(1) as f32);
        let content_w = ((width as f32 * scale).round() as usize).min(input);
        let content_h = ((height as f32 * scale).round() as usize).min(input);
        Self {
            scale,
            pad_x: ((input - content_w) / 2) as f32,
            pad_y: ((input - content_h) / 2) as f32,
            content_w,
            content_h,
        }
    }

    /// Frame to input coordinates.
    pub fn transform(&self) -> Similarity {
        Similarity::scale_translate(self.scale, self.pad_x, self.pad_y)
    }

    /// Input to frame coordinates.
    pub fn to_frame(&self, p: Point) -> Point {
        Point::new((p.x - self.pad_x) / self.scale, (p.y - self.pad_y) / self.scale)
    }

    fn contains(&self, x: usize, y: usize) -> bool {
        let (px, py) = (self.pad_x as usize, self.pad_y as usize);
        x >= px && x < px + self.content_w && y >= py && y < py + self.content_h
    }
}

/// Output tensor positions (score, bbox, kps) for each stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots([(usize, usize, usize); 3]);

impl StrideSlots {
    const POSITIONAL: StrideSlots = StrideSlots([(0, 3, 6), (1, 4, 7), (2, 5, 8)]);

    /// Exports either name their tensors `score_8`, `bbox_16`, `kps_32`, ...
    /// or use opaque numeric names in the standard positional order.
    fn discover(names: &[String]) -> Self {
        let find = |prefix: &str, stride: usize| {
            let target = format!("{prefix}_{stride}");
            names.iter().position(|n| *n == target)
        };

        let mut slots = [(0, 0, 0); 3];
        for (slot, &stride) in slots.iter_mut().zip(&SCRFD_STRIDES) {
            match (find("score", stride), find("bbox", stride), find("kps", stride)) {
                (Some(s), Some(b), Some(k)) => *slot = (s, b, k),
                _ => {
                    tracing::debug!(?names, "SCRFD outputs unnamed; using positional mapping");
                    return Self::POSITIONAL;
                }
            }
        }
        Self(slots)
    }
}

/// SCRFD face detector.
pub struct FaceDetector {
    session: Session,
    slots: StrideSlots,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::UnsupportedModel(format!(
                "expected 9 outputs (score/bbox/kps for 3 strides), got {}",
                names.len()
            )));
        }
        let slots = StrideSlots::discover(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD detector");

        Ok(Self {
            session,
            slots,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    /// All faces in a grayscale frame, highest confidence first.
    pub fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let letterbox = Letterbox::fit(width as usize, height as usize, SCRFD_INPUT_SIZE);
        let input = preprocess(pixels, width as usize, height as usize, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.slots.0) {
            let extract = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let level = StrideOutput {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(level.decode(&letterbox, self.confidence_threshold));
        }

        Ok(nms(candidates, self.nms_threshold))
    }
}

/// The face nearest the camera wins; confidence only breaks area ties.
pub fn best_candidate(faces: Vec<BoundingBox>) -> Option<BoundingBox> {
    faces.into_iter().max_by(|a, b| {
        a.area()
            .total_cmp(&b.area())
            .then(a.confidence.total_cmp(&b.confidence))
    })
}

fn preprocess(pixels: &[u8], width: usize, height: usize, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let resized = warp(pixels, width, height, &letterbox.transform(), size, size);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            // Padding stays at the normalised mean (0.0).
            if !letterbox.contains(x, y) {
                continue;
            }
            let v = (resized[y * size + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

/// Raw tensors of one stride level.
struct StrideOutput<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideOutput<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE / self.stride;
        let grid_h = SCRFD_INPUT_SIZE / self.stride;
        let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
        let s = self.stride as f32;

        let mut out = Vec::new();
        for idx in 0..anchors.min(self.scores.len()) {
            let score = self.scores[idx];
            if score <= threshold {
                continue;
            }
            let Some(d) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let anchor = Point::new((cell % grid_w) as f32 * s, (cell / grid_w) as f32 * s);

            let top_left = letterbox.to_frame(Point::new(anchor.x - d[0] * s, anchor.y - d[1] * s));
            let bottom_right = letterbox.to_frame(Point::new(anchor.x + d[2] * s, anchor.y + d[3] * s));

            let keypoints = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_frame(Point::new(anchor.x + k[i * 2] * s, anchor.y + k[i * 2 + 1] * s))
                })
            });

            out.push(BoundingBox {
                x: top_left.x,
                y: top_left.y,
                width: bottom_right.x - top_left.x,
                height: bottom_right.y - top_left.y,
                confidence: score,
                keypoints,
            });
        }
        out
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
