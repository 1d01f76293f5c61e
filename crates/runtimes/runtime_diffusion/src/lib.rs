//! faceforge_runtime_diffusion - Diffusion model inference runtime
//!
//! This crate provides SDXL image generation steered by a ControlNet.
//! Weights are read from local safetensors files; fetching them is the
//! caller's job, see [`SdxlFiles::manifest`].

mod controlnet;
mod sdxl;

use anyhow::Result;
use candle_core::Device;
use std::path::PathBuf;

pub use controlnet::{ControlNetConfig, ControlNetModel, ControlNetOutput};
pub use sdxl::SdxlControlNetPipeline;

/// Tokenizer for the first SDXL text encoder
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
/// Tokenizer for the second SDXL text encoder
pub const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

/// Precision and memory settings for the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Half precision for the UNet and ControlNet (ignored on CPU)
    pub use_f16: bool,
    pub use_flash_attn: bool,
    /// Load text encoders per request instead of keeping them resident
    pub cpu_offload: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            use_f16: true,
            use_flash_attn: false,
            cpu_offload: true,
        }
    }
}

/// Pick the compute device. Falls back to CPU when no accelerator is compiled in.
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if !use_gpu {
        tracing::info!("Using CPU device (GPU disabled in config)");
        return Ok(Device::Cpu);
    }

    #[cfg(feature = "metal")]
    {
        tracing::info!("Using Metal device");
        Ok(Device::new_metal(0)?)
    }
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    {
        tracing::info!("Using CUDA device");
        Ok(Device::new_cuda(0)?)
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::info!("Using CPU device (no GPU features enabled)");
        Ok(Device::Cpu)
    }
}

/// A file inside a Hugging Face repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFile {
    pub repo: String,
    pub filename: String,
}

impl HubFile {
    fn new(repo: &str, filename: &str) -> Self {
        Self {
            repo: repo.to_string(),
            filename: filename.to_string(),
        }
    }
}

/// Local paths of every file the SDXL base pipeline needs
#[derive(Debug, Clone)]
pub struct SdxlFiles {
    pub tokenizer: PathBuf,
    pub tokenizer_2: PathBuf,
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl SdxlFiles {
    /// Files to fetch, in the order [`SdxlFiles::from_paths`] expects them
    pub fn manifest(base_repo: &str, use_f16: bool) -> [HubFile; 6] {
        let variant = if use_f16 { ".fp16" } else { "" };
        [
            HubFile::new(CLIP_TOKENIZER_REPO, "tokenizer.json"),
            HubFile::new(CLIP2_TOKENIZER_REPO, "tokenizer.json"),
            HubFile::new(base_repo, &format!("text_encoder/model{variant}.safetensors")),
            HubFile::new(base_repo, &format!("text_encoder_2/model{variant}.safetensors")),
            HubFile::new(
                base_repo,
                &format!("unet/diffusion_pytorch_model{variant}.safetensors"),
            ),
            HubFile::new(
                base_repo,
                &format!("vae/diffusion_pytorch_model{variant}.safetensors"),
            ),
        ]
    }

    pub fn from_paths(paths: [PathBuf; 6]) -> Self {
        let [tokenizer, tokenizer_2, text_encoder, text_encoder_2, unet, vae] = paths;
        Self {
            tokenizer,
            tokenizer_2,
            text_encoder,
            text_encoder_2,
            unet,
            vae,
        }
    }
}
