//! faceforge_runtime_api - Runtime API traits and types
//!
//! This crate defines the contract between the daemon and the model runtimes.
//! The diffusion runtime implements [`DiffusionModel`], the face runtime
//! implements [`FaceAnalyzer`].

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Sampling parameters for a generation call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
}

impl Default for GenerationParams {
    /// The fixed configuration used for every invocation
    fn default() -> Self {
        Self {
            steps: 30,
            guidance_scale: 7.5,
            width: 1024,
            height: 1024,
            seed: 42,
        }
    }
}

/// Image generation request
#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub prompt: String,
    /// Reference image fed to the conditioning network
    pub control_image: RgbImage,
    pub params: GenerationParams,
}

/// Trait for diffusion model backends
pub trait DiffusionModel: Send + Sync {
    /// Generate an image from a prompt and a control image
    fn generate(&self, request: &ImageGenRequest) -> Result<RgbImage>;

    /// Get the model name
    fn name(&self) -> &str;
}

/// Identity embedding of a single face
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    /// Raw recognizer output
    pub vector: Vec<f32>,
    /// L2 norm of `vector`
    pub norm: f32,
}

impl FaceEmbedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        Self { vector, norm }
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Unit-length copy of the vector
    pub fn normalized(&self) -> Vec<f32> {
        if self.norm > 0.0 {
            self.vector.iter().map(|v| v / self.norm).collect()
        } else {
            self.vector.clone()
        }
    }

    pub fn cosine_similarity(&self, other: &FaceEmbedding) -> f32 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let dot: f32 = self
            .vector
            .iter()
            .zip(other.vector.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot / (self.norm * other.norm)
    }
}

/// Axis-aligned face box in source image pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A detected face with its landmarks and identity embedding
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Eyes, nose tip, mouth corners
    pub landmarks: [(f32, f32); 5],
    pub embedding: FaceEmbedding,
}

/// Trait for face analysis backends
pub trait FaceAnalyzer: Send + Sync {
    /// Detect faces and compute their embeddings, most confident first
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>>;
}
