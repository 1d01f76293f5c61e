//! Request-level generation flow: fetch, face extraction, diffusion

use faceforge_core::{FetchError, ImageSource};
use faceforge_runtime_api::{
    DiffusionModel, FaceAnalyzer, FaceEmbedding, GenerationParams, ImageGenRequest,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure kinds of a generation. The display text is what API clients see.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Could not download person image")]
    PersonImageUnavailable(#[source] FetchError),

    #[error("Could not extract face features")]
    NoFace,

    #[error("{0}")]
    Pipeline(anyhow::Error),
}

/// Everything a caller supplies for one generation
#[derive(Debug, Clone)]
pub struct GenerationInputs {
    pub person_image: String,
    pub clothing_images: Vec<String>,
    pub place_image: Option<String>,
    pub prompt: String,
}

pub struct ImageGenerator {
    images: Arc<dyn ImageSource>,
    faces: Arc<dyn FaceAnalyzer>,
    pipeline: Arc<dyn DiffusionModel>,
    params: GenerationParams,
    gate: Option<Arc<Mutex<()>>>,
}

impl ImageGenerator {
    pub fn new(
        images: Arc<dyn ImageSource>,
        faces: Arc<dyn FaceAnalyzer>,
        pipeline: Arc<dyn DiffusionModel>,
    ) -> Self {
        Self {
            images,
            faces,
            pipeline,
            params: GenerationParams::default(),
            gate: None,
        }
    }

    /// Admit at most one pipeline invocation at a time
    pub fn serialized(mut self, enabled: bool) -> Self {
        self.gate = enabled.then(|| Arc::new(Mutex::new(())));
        self
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Embedding of the most confident face, or `None` when there is no usable face
    pub async fn extract_face_embedding(&self, image: &RgbImage) -> Option<FaceEmbedding> {
        let faces = self.faces.clone();
        let image = image.clone();

        match tokio::task::spawn_blocking(move || faces.analyze(&image)).await {
            Ok(Ok(detected)) => {
                tracing::debug!("Detected {} faces", detected.len());
                detected.into_iter().next().map(|face| face.embedding)
            }
            Ok(Err(e)) => {
                tracing::warn!("Error extracting face features: {:#}", e);
                None
            }
            Err(e) => {
                tracing::error!("Face analysis task failed: {}", e);
                None
            }
        }
    }

    pub async fn generate(&self, inputs: &GenerationInputs) -> Result<RgbImage, GenerateError> {
        if !inputs.clothing_images.is_empty() || inputs.place_image.is_some() {
            tracing::debug!(
                "Ignoring {} clothing images and place image {:?}",
                inputs.clothing_images.len(),
                inputs.place_image
            );
        }

        let person = self
            .images
            .fetch(&inputs.person_image)
            .await
            .map_err(|e| {
                tracing::warn!("Error downloading image: {}", e);
                GenerateError::PersonImageUnavailable(e)
            })?;

        let embedding = self
            .extract_face_embedding(&person)
            .await
            .ok_or(GenerateError::NoFace)?;
        tracing::info!("Extracted face embedding ({} dims)", embedding.len());

        let request = ImageGenRequest {
            prompt: inputs.prompt.clone(),
            control_image: person,
            params: self.params,
        };

        // The permit moves into the blocking task so a dropped request keeps the
        // gate closed until the pipeline actually returns
        let permit = match &self.gate {
            Some(gate) => Some(gate.clone().lock_owned().await),
            None => None,
        };

        let pipeline = self.pipeline.clone();
        tracing::info!("Generating with {}", pipeline.name());
        let image = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.generate(&request)
        })
            .await
            .map_err(|e| GenerateError::Pipeline(anyhow::anyhow!("Generation task failed: {}", e)))?
            .map_err(GenerateError::Pipeline)?;

        Ok(image)
    }
}
