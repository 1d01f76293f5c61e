//! ArcFace identity embedder

use anyhow::{Context, Result};
use faceforge_runtime_api::FaceEmbedding;
use image::RgbImage;
use ort::{session::Session, value::Tensor};
use parking_lot::Mutex;
use std::path::Path;

use crate::align::ALIGNED_SIZE;
use crate::to_nchw;

const INPUT_MEAN: f32 = 127.5;
const INPUT_STD: f32 = 127.5;

pub struct FaceRecognizer {
    session: Mutex<Session>,
}

impl FaceRecognizer {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("Failed to create recognition session from {:?}", model_path)
            })?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Embed a face already aligned to the 112x112 template
    pub fn embed(&self, aligned: &RgbImage) -> Result<FaceEmbedding> {
        if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
            anyhow::bail!(
                "Aligned face must be {}x{}, got {:?}",
                ALIGNED_SIZE,
                ALIGNED_SIZE,
                aligned.dimensions()
            );
        }

        let size = ALIGNED_SIZE as i64;
        let input = Tensor::from_array((
            vec![1i64, 3, size, size],
            to_nchw(aligned, INPUT_MEAN, INPUT_STD),
        ))?;

        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("Recognition model has no outputs")?;

        let outputs = session
            .run(ort::inputs![input_name.as_str() => input])
            .context("Face recognition inference failed")?;
        let (_, data) = outputs
            .get(output_name.as_str())
            .with_context(|| format!("Recognition output {} missing", output_name))?
            .try_extract_tensor::<f32>()?;

        Ok(FaceEmbedding::new(data.to_vec()))
    }
}
