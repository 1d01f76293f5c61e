//! Startup model loading
//!
//! Everything is loaded before the server binds; a failure anywhere means the
//! service never starts.

use anyhow::{Context, Result};
use faceforge_core::downloaders::{Downloader, HuggingFaceDownloader};
use faceforge_core::{Config, HttpImageSource};
use faceforge_runtime_diffusion::{
    select_device, PipelineOptions, SdxlControlNetPipeline, SdxlFiles,
};
use faceforge_runtime_face::FaceAnalysis;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::generator::ImageGenerator;
use crate::state::AppState;

/// Load every model the service needs
pub async fn load_models(config: &Config) -> Result<AppState> {
    tracing::info!("Loading InstantID models...");

    match build_state(config).await {
        Ok(state) => {
            tracing::info!("Models loaded successfully");
            Ok(state)
        }
        Err(e) => {
            tracing::error!("Error loading models: {:#}", e);
            Err(e)
        }
    }
}

/// Make sure the SDXL base files are in the local store, downloading what is missing
pub async fn fetch_pipeline_files(config: &Config) -> Result<SdxlFiles> {
    let downloader =
        HuggingFaceDownloader::new(config.models_dir(), config.models.hf_token.as_deref())?;

    let manifest = SdxlFiles::manifest(&config.models.base_model, config.inference.use_f16);
    let mut paths: Vec<PathBuf> = Vec::with_capacity(manifest.len());
    for file in &manifest {
        paths.push(downloader.fetch(&file.repo, &file.filename).await?);
    }

    let paths: [PathBuf; 6] = paths
        .try_into()
        .map_err(|_| anyhow::anyhow!("Incomplete SDXL file set"))?;
    Ok(SdxlFiles::from_paths(paths))
}

async fn build_state(config: &Config) -> Result<AppState> {
    let files = fetch_pipeline_files(config).await?;

    let device = select_device(config.inference.use_gpu)?;
    let options = PipelineOptions {
        use_f16: config.inference.use_f16,
        use_flash_attn: false,
        cpu_offload: config.inference.cpu_offload,
    };
    let controlnet_dir = config.models.controlnet_path.clone();
    let pipeline = tokio::task::spawn_blocking(move || {
        SdxlControlNetPipeline::load(&files, &controlnet_dir, &device, &options)
    })
    .await
    .context("Pipeline loading task failed")??;

    let face_dir = config.face_model_dir();
    let det_size = config.inference.det_size;
    let faces = tokio::task::spawn_blocking(move || FaceAnalysis::prepare(&face_dir, det_size))
        .await
        .context("Face model loading task failed")??;

    let images = HttpImageSource::new(Duration::from_secs(config.inference.fetch_timeout_secs))?;

    let generator = ImageGenerator::new(Arc::new(images), Arc::new(faces), Arc::new(pipeline))
        .serialized(config.daemon.serialize_generation);

    Ok(AppState::new(generator))
}
