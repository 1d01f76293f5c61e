//! faceforge_runtime_face - Face analysis runtime
//!
//! Detects faces with SCRFD and embeds them with ArcFace, using the ONNX
//! models of an InsightFace model pack such as `buffalo_l`.

mod align;
mod detector;
mod recognizer;

use anyhow::Result;
use faceforge_runtime_api::{DetectedFace, FaceAnalyzer};
use image::RgbImage;
use std::path::Path;

pub use align::{align_face, estimate_similarity, ARCFACE_TEMPLATE};
pub use detector::{Detection, FaceDetector};
pub use recognizer::FaceRecognizer;

/// Detection model inside a model pack
pub const DETECTION_MODEL: &str = "det_10g.onnx";
/// Recognition model inside a model pack
pub const RECOGNITION_MODEL: &str = "w600k_r50.onnx";

/// Detector and recognizer of one model pack
pub struct FaceAnalysis {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalysis {
    /// Load the model pack in `model_dir` with a square detection input of `det_size`
    pub fn prepare(model_dir: &Path, det_size: u32) -> Result<Self> {
        let detection = model_dir.join(DETECTION_MODEL);
        let recognition = model_dir.join(RECOGNITION_MODEL);
        for path in [&detection, &recognition] {
            if !path.exists() {
                anyhow::bail!("Face model not found: {:?}", path);
            }
        }

        tracing::info!("Loading face detector from {:?}", detection);
        let detector = FaceDetector::new(&detection, det_size)?;
        tracing::info!("Loading face recognizer from {:?}", recognition);
        let recognizer = FaceRecognizer::new(&recognition)?;

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for FaceAnalysis {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>> {
        self.detector
            .detect(image)?
            .into_iter()
            .map(|detection| {
                let aligned = align_face(image, &detection.landmarks);
                Ok(DetectedFace {
                    bbox: detection.bbox,
                    score: detection.score,
                    landmarks: detection.landmarks,
                    embedding: self.recognizer.embed(&aligned)?,
                })
            })
            .collect()
    }
}

/// Planar RGB tensor data, each value mapped to `(v - mean) / std`
pub(crate) fn to_nchw(image: &RgbImage, mean: f32, std: f32) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; plane * 3];

    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 - mean) / std;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_layout_and_normalization() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, image::Rgb([255, 127, 0]));
        image.put_pixel(1, 0, image::Rgb([0, 0, 255]));

        let data = to_nchw(&image, 127.5, 127.5);
        assert_eq!(data.len(), 6);
        assert_eq!(data[0], 1.0); // R of first pixel
        assert_eq!(data[1], -1.0); // R of second pixel
        assert!((data[2] + 0.003_921_6).abs() < 1e-5);
        assert_eq!(data[5], 1.0);
    }

    #[test]
    fn missing_model_pack_is_an_error() {
        let dir = std::env::temp_dir().join("faceforge-no-such-pack");
        let err = FaceAnalysis::prepare(&dir, 640).err().unwrap();
        assert!(err.to_string().contains(DETECTION_MODEL));
    }
}
