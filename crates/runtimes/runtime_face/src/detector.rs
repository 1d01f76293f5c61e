//! SCRFD face detector
//!
//! Runs the InsightFace `det_10g` model on a letterboxed square input and
//! decodes its per-stride score, box and keypoint heads into face boxes
//! in source image coordinates.

use anyhow::{Context, Result};
use faceforge_runtime_api::BoundingBox;
use image::{imageops::FilterType, RgbImage};
use ort::{session::Session, value::Tensor};
use parking_lot::Mutex;
use std::path::Path;

use crate::to_nchw;

const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const INPUT_MEAN: f32 = 127.5;
const INPUT_STD: f32 = 128.0;

/// A raw detection before embedding
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: [(f32, f32); 5],
}

/// Resize keeping aspect ratio, pasted at the top-left of a black square.
/// Returns the canvas and the factor from source to canvas pixels.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, f32) {
    let (width, height) = image.dimensions();
    let (new_w, new_h) = if height > width {
        let new_w = ((size as f32 * width as f32 / height as f32) as u32).max(1);
        (new_w, size)
    } else {
        let new_h = ((size as f32 * height as f32 / width as f32) as u32).max(1);
        (size, new_h)
    };
    let scale = new_h as f32 / height as f32;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(size, size);
    image::imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, scale)
}

/// Decode one stride's heads. `scale` maps canvas pixels back to the source.
pub fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    keypoints: Option<&[f32]>,
    stride: u32,
    input_size: u32,
    threshold: f32,
    scale: f32,
) -> Vec<Detection> {
    let cells = (input_size / stride) as usize;
    let step = stride as f32;
    let mut detections = Vec::new();

    for (index, &score) in scores.iter().enumerate().take(cells * cells * ANCHORS_PER_CELL) {
        if score < threshold {
            continue;
        }
        let Some(distances) = boxes.get(index * 4..index * 4 + 4) else {
            continue;
        };

        let cell = index / ANCHORS_PER_CELL;
        let cx = (cell % cells) as f32 * step;
        let cy = (cell / cells) as f32 * step;

        let bbox = BoundingBox {
            x1: (cx - distances[0] * step) / scale,
            y1: (cy - distances[1] * step) / scale,
            x2: (cx + distances[2] * step) / scale,
            y2: (cy + distances[3] * step) / scale,
        };

        let mut landmarks = [(0.0, 0.0); 5];
        if let Some(kps) = keypoints.and_then(|k| k.get(index * 10..index * 10 + 10)) {
            for (point, offsets) in landmarks.iter_mut().zip(kps.chunks_exact(2)) {
                *point = (
                    (cx + offsets[0] * step) / scale,
                    (cy + offsets[1] * step) / scale,
                );
            }
        }

        detections.push(Detection {
            bbox,
            score,
            landmarks,
        });
    }

    detections
}

/// Greedy non-maximum suppression, highest score first
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub struct FaceDetector {
    session: Mutex<Session>,
    input_size: u32,
    score_threshold: f32,
    nms_threshold: f32,
}

impl FaceDetector {
    pub fn new(model_path: &Path, input_size: u32) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to create detection session from {:?}", model_path))?;

        let outputs = session.outputs.len();
        if outputs != STRIDES.len() * 3 {
            anyhow::bail!(
                "Unsupported detection model: expected {} outputs, found {}",
                STRIDES.len() * 3,
                outputs
            );
        }

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        })
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (canvas, scale) = letterbox(image, self.input_size);
        let size = self.input_size as i64;
        let input = Tensor::from_array((
            vec![1i64, 3, size, size],
            to_nchw(&canvas, INPUT_MEAN, INPUT_STD),
        ))?;

        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        let outputs = session
            .run(ort::inputs![input_name.as_str() => input])
            .context("Face detection inference failed")?;

        let head = |index: usize| -> Result<&[f32]> {
            let name = &output_names[index];
            let value = outputs
                .get(name.as_str())
                .with_context(|| format!("Detection output {} missing", name))?;
            let (_, data) = value.try_extract_tensor::<f32>()?;
            Ok(data)
        };

        let mut detections = Vec::new();
        for (i, &stride) in STRIDES.iter().enumerate() {
            detections.extend(decode_stride(
                head(i)?,
                head(i + STRIDES.len())?,
                Some(head(i + STRIDES.len() * 2)?),
                stride,
                self.input_size,
                self.score_threshold,
                scale,
            ));
        }

        let faces = nms(detections, self.nms_threshold);
        tracing::debug!("Detected {} faces", faces.len());
        Ok(faces)
    }
}
