//! SDXL + ControlNet pipeline implementation
//!
//! Wraps candle-transformers' stable_diffusion module for image generation,
//! with residuals from a [`ControlNetModel`] added at every denoising step.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use faceforge_runtime_api::{DiffusionModel, ImageGenRequest};
use image::{imageops::FilterType, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::controlnet::ControlNetModel;
use crate::{PipelineOptions, SdxlFiles};

/// Latent scaling of the SDXL VAE
const VAE_SCALE: f64 = 0.13025;
/// Spatial downscale between pixels and latents
const LATENT_FACTOR: usize = 8;
const CONTROLNET_CONDITIONING_SCALE: f64 = 1.0;

/// CLIP text encoder with its tokenizer. With offloading, the weights are
/// only materialized while a prompt is being encoded.
struct TextEncoder {
    tokenizer: Tokenizer,
    config: stable_diffusion::clip::Config,
    weights: PathBuf,
    pad_id: u32,
    resident: Option<ClipTextTransformer>,
}

impl TextEncoder {
    fn load(
        tokenizer_path: &Path,
        weights: &Path,
        config: stable_diffusion::clip::Config,
        device: &Device,
        keep_resident: bool,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {:?}: {}", tokenizer_path, e)
        })?;

        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow::anyhow!("Pad token {:?} missing from tokenizer", pad_token))?;

        let resident = if keep_resident {
            Some(stable_diffusion::build_clip_transformer(
                &config,
                weights,
                device,
                DType::F32,
            )?)
        } else {
            None
        };

        Ok(Self {
            tokenizer,
            config,
            weights: weights.to_path_buf(),
            pad_id,
            resident,
        })
    }

    fn tokens(&self, text: &str, device: &Device) -> Result<Tensor> {
        let max_len = self.config.max_position_embeddings;
        let mut ids = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();

        if ids.len() > max_len {
            // Keep the end-of-text marker
            let eot = ids[ids.len() - 1];
            ids.truncate(max_len - 1);
            ids.push(eot);
        }
        ids.resize(max_len, self.pad_id);

        Ok(Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?)
    }

    /// Hidden states for `["", prompt]`, shape (2, seq_len, hidden)
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let tokens = Tensor::cat(&[self.tokens("", device)?, self.tokens(prompt, device)?], 0)?;

        let hidden = match &self.resident {
            Some(model) => model.forward(&tokens)?,
            None => {
                let model = stable_diffusion::build_clip_transformer(
                    &self.config,
                    &self.weights,
                    device,
                    DType::F32,
                )?;
                model.forward(&tokens)?
            }
        };
        Ok(hidden)
    }
}

/// SDXL base pipeline steered by a ControlNet
pub struct SdxlControlNetPipeline {
    sd_config: StableDiffusionConfig,
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    controlnet: ControlNetModel,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
}

impl SdxlControlNetPipeline {
    /// Load the pipeline from resolved SDXL files and a ControlNet directory
    pub fn load(
        files: &SdxlFiles,
        controlnet_dir: &Path,
        device: &Device,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let dtype = if options.use_f16 && !device.is_cpu() {
            DType::F16
        } else {
            DType::F32
        };
        tracing::info!("Pipeline dtype: {:?}", dtype);

        let sd_config = StableDiffusionConfig::sdxl(None, None, None);
        let clip2 = sd_config
            .clip2
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SDXL config is missing its second text encoder"))?;

        let keep_resident = !options.cpu_offload;
        tracing::info!(
            "Loading text encoders ({})",
            if keep_resident { "resident" } else { "offloaded" }
        );
        let text_encoders = vec![
            TextEncoder::load(
                &files.tokenizer,
                &files.text_encoder,
                sd_config.clip.clone(),
                device,
                keep_resident,
            )?,
            TextEncoder::load(
                &files.tokenizer_2,
                &files.text_encoder_2,
                clip2,
                device,
                keep_resident,
            )?,
        ];

        tracing::info!("Loading UNet from {:?}", files.unet);
        let unet = sd_config.build_unet(&files.unet, device, 4, options.use_flash_attn, dtype)?;

        tracing::info!("Loading ControlNet from {:?}", controlnet_dir);
        let controlnet =
            ControlNetModel::load(controlnet_dir, device, dtype, options.use_flash_attn)?;

        // The fp16 SDXL VAE overflows, decode in full precision
        tracing::info!("Loading VAE from {:?}", files.vae);
        let vae = sd_config.build_vae(&files.vae, device, DType::F32)?;

        Ok(Self {
            sd_config,
            text_encoders,
            unet,
            controlnet,
            vae,
            device: device.clone(),
            dtype,
        })
    }

    /// Concatenated embeddings of both encoders, shape (2, 77, 2048)
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let parts = self
            .text_encoders
            .iter()
            .map(|encoder| encoder.encode(prompt, &self.device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn generate_internal(&self, request: &ImageGenRequest) -> Result<RgbImage> {
        let params = &request.params;
        if params.width % LATENT_FACTOR != 0 || params.height % LATENT_FACTOR != 0 {
            anyhow::bail!(
                "Image dimensions must be divisible by {}. Got {}x{}",
                LATENT_FACTOR,
                params.width,
                params.height
            );
        }

        let text_embeddings = self.encode_prompt(&request.prompt)?;

        let control = control_image_tensor(
            &request.control_image,
            params.width,
            params.height,
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let control = Tensor::cat(&[&control, &control], 0)?;

        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = initial_latents(
            params.seed,
            (
                1,
                4,
                params.height / LATENT_FACTOR,
                params.width / LATENT_FACTOR,
            ),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (step, &timestep) in timesteps.iter().enumerate() {
            tracing::debug!("Denoising step {}/{} (t={})", step + 1, timesteps.len(), timestep);

            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;

            let residuals = self.controlnet.forward(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                &control,
                CONTROLNET_CONDITIONING_SCALE,
            )?;

            let noise_pred = self.unet.forward_with_additional_residuals(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                Some(residuals.down_residuals.as_slice()),
                Some(&residuals.mid_residual),
            )?;

            // Classifier-free guidance
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (uncond + ((text - uncond)? * params.guidance_scale)?)?;

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let latents = (latents.to_dtype(DType::F32)? / VAE_SCALE)?;
        let image = self.vae.decode(&latents)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?
            .to_dtype(DType::U8)?
            .i(0)?;

        tensor_to_rgb(&image)
    }
}

impl DiffusionModel for SdxlControlNetPipeline {
    fn generate(&self, request: &ImageGenRequest) -> Result<RgbImage> {
        self.generate_internal(request)
    }

    fn name(&self) -> &str {
        "SDXL-ControlNet"
    }
}

/// Gaussian latents drawn from a host RNG, so a seed means the same noise on every device
pub(crate) fn initial_latents(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (b, c, h, w) = shape;
    let data: Vec<f32> = (0..b * c * h * w)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Resize to the output resolution and scale to [0, 1], shape (1, 3, height, width)
pub(crate) fn control_image_tensor(
    image: &RgbImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let resized = image::imageops::resize(image, width as u32, height as u32, FilterType::Lanczos3);
    let data = resized.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.)?.unsqueeze(0)?)
}

/// Convert a (3, height, width) u8 tensor into an RGB image
pub(crate) fn tensor_to_rgb(image: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        anyhow::bail!("Expected an image with 3 channels, got {}", channels);
    }
    let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("Error converting tensor to image buffer"))
}
