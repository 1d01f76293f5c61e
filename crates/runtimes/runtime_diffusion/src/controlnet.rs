//! ControlNet for SDXL
//!
//! A trainable copy of the UNet encoder that turns a conditioning image into
//! residuals added to the UNet's skip connections and mid block. Weights and
//! `config.json` follow the diffusers `ControlNetModel` layout.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
    UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
};
use serde::Deserialize;
use std::path::Path;

const WEIGHT_FILES: [&str; 2] = [
    "diffusion_pytorch_model.safetensors",
    "diffusion_pytorch_model.fp16.safetensors",
];

/// A setting given once for all blocks or once per block
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PerBlock {
    Uniform(usize),
    Each(Vec<usize>),
}

impl PerBlock {
    pub fn get(&self, index: usize) -> Result<usize> {
        match self {
            PerBlock::Uniform(v) => Ok(*v),
            PerBlock::Each(values) => values
                .get(index)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("No per-block value for block {}", index)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlNetConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_conditioning_channels")]
    pub conditioning_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<String>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    /// Number of heads per block (diffusers keeps the historical name)
    pub attention_head_dim: PerBlock,
    #[serde(default)]
    pub num_attention_heads: Option<PerBlock>,
    #[serde(default = "default_transformer_layers")]
    pub transformer_layers_per_block: PerBlock,
    pub cross_attention_dim: usize,
    #[serde(default = "default_conditioning_embedding_out_channels")]
    pub conditioning_embedding_out_channels: Vec<usize>,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_downsample_padding")]
    pub downsample_padding: usize,
    #[serde(default = "default_mid_block_scale_factor")]
    pub mid_block_scale_factor: f64,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub use_linear_projection: bool,
}

fn default_in_channels() -> usize {
    4
}

fn default_conditioning_channels() -> usize {
    3
}

fn default_layers_per_block() -> usize {
    2
}

fn default_transformer_layers() -> PerBlock {
    PerBlock::Uniform(1)
}

fn default_conditioning_embedding_out_channels() -> Vec<usize> {
    vec![16, 32, 96, 256]
}

fn default_true() -> bool {
    true
}

fn default_downsample_padding() -> usize {
    1
}

fn default_mid_block_scale_factor() -> f64 {
    1.0
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_norm_eps() -> f64 {
    1e-5
}

impl ControlNetConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("ControlNet config not found at {:?}", path))?;
        let config = serde_json::from_reader(file)
            .with_context(|| format!("Invalid ControlNet config {:?}", path))?;
        Ok(config)
    }

    fn heads(&self, block: usize) -> Result<usize> {
        self.num_attention_heads
            .as_ref()
            .unwrap_or(&self.attention_head_dim)
            .get(block)
    }
}

/// Small conv stack that brings the conditioning image down to latent resolution
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(
        vb: VarBuilder,
        conditioning_channels: usize,
        channels: &[usize],
        out_channels: usize,
    ) -> Result<Self> {
        let (first, last) = match (channels.first(), channels.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => anyhow::bail!("conditioning_embedding_out_channels must not be empty"),
        };

        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let down = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let conv_in = conv2d(conditioning_channels, first, 3, same, vb.pp("conv_in"))?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * channels.len());
        for (i, pair) in channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(conv2d(c_in, c_in, 3, same, vb_blocks.pp(2 * i))?);
            blocks.push(conv2d(c_in, c_out, 3, down, vb_blocks.pp(2 * i + 1))?);
        }

        let conv_out = conv2d(last, out_channels, 3, same, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in self.blocks.iter() {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

/// 1x1 projection, zero-initialized in training
fn zero_conv(channels: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    conv2d(channels, channels, 1, Default::default(), vb)
}

/// Residuals produced for one denoising step
pub struct ControlNetOutput {
    pub down_residuals: Vec<Tensor>,
    pub mid_residual: Tensor,
}

pub struct ControlNetModel {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    controlnet_down_blocks: Vec<Conv2d>,
    controlnet_mid_block: Conv2d,
}

impl ControlNetModel {
    /// Load from a diffusers directory holding `config.json` and safetensors weights
    pub fn load(dir: &Path, device: &Device, dtype: DType, use_flash_attn: bool) -> Result<Self> {
        let config = ControlNetConfig::from_file(&dir.join("config.json"))?;

        let weights = WEIGHT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
            .ok_or_else(|| anyhow::anyhow!("ControlNet weights not found in {:?}", dir))?;

        tracing::info!("Loading ControlNet weights from {:?}", weights);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        Self::new(vb, &config, use_flash_attn)
    }

    pub fn new(vb: VarBuilder, config: &ControlNetConfig, use_flash_attn: bool) -> Result<Self> {
        let n_blocks = config.block_out_channels.len();
        if n_blocks == 0 || config.down_block_types.len() != n_blocks {
            anyhow::bail!(
                "ControlNet config lists {} block channels but {} down block types",
                n_blocks,
                config.down_block_types.len()
            );
        }

        let b_channels = config.block_out_channels[0];
        let time_embed_dim = b_channels * 4;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(config.in_channels, b_channels, 3, same, vb.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vb.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding = ConditioningEmbedding::new(
            vb.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            b_channels,
        )?;

        let vb_zero = vb.pp("controlnet_down_blocks");
        let mut controlnet_down_blocks = vec![zero_conv(b_channels, vb_zero.pp(0))?];

        let vb_down = vb.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block_type) in config.down_block_types.iter().enumerate() {
            let in_channels = if i > 0 {
                config.block_out_channels[i - 1]
            } else {
                b_channels
            };
            let out_channels = config.block_out_channels[i];
            let add_downsample = i < n_blocks - 1;

            let db_cfg = DownBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_downsample,
                downsample_padding: config.downsample_padding,
                ..Default::default()
            };

            let block = match block_type.as_str() {
                "DownBlock2D" => DownBlock::Basic(DownBlock2D::new(
                    vb_down.pp(i),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    db_cfg,
                )?),
                "CrossAttnDownBlock2D" => {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: config.heads(i)?,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: None,
                        use_linear_projection: config.use_linear_projection,
                        transformer_layers_per_block: config.transformer_layers_per_block.get(i)?,
                    };
                    DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                        vb_down.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?)
                }
                other => anyhow::bail!("Unsupported ControlNet down block type {}", other),
            };
            down_blocks.push(block);

            let residuals_per_block = config.layers_per_block + usize::from(add_downsample);
            for _ in 0..residuals_per_block {
                let index = controlnet_down_blocks.len();
                controlnet_down_blocks.push(zero_conv(out_channels, vb_zero.pp(index))?);
            }
        }

        let mid_channels = config.block_out_channels[n_blocks - 1];
        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: config.heads(n_blocks - 1)?,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: config.transformer_layers_per_block.get(n_blocks - 1)?,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vb.pp("mid_block"),
            mid_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let controlnet_mid_block = zero_conv(mid_channels, vb.pp("controlnet_mid_block"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            controlnet_down_blocks,
            controlnet_mid_block,
        })
    }

    /// Compute residuals for one step. `cond` must be 8x the latent resolution
    /// for the standard conditioning embedding.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlNetOutput> {
        let (bsize, _channels, _height, _width) = xs.dims4()?;

        let emb = (Tensor::ones(bsize, DType::F32, xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb.to_dtype(xs.dtype())?)?;

        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(cond)?;
        let mut xs = (xs + cond)?;

        let mut residuals = vec![xs.clone()];
        for block in self.down_blocks.iter() {
            let (next, block_residuals) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            residuals.extend(block_residuals);
            xs = next;
        }

        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down_residuals = residuals
            .iter()
            .zip(self.controlnet_down_blocks.iter())
            .map(|(res, conv)| conv.forward(res)?.affine(conditioning_scale, 0.0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mid_residual = self
            .controlnet_mid_block
            .forward(&xs)?
            .affine(conditioning_scale, 0.0)?;

        Ok(ControlNetOutput {
            down_residuals,
            mid_residual,
        })
    }

    pub fn num_down_residuals(&self) -> usize {
        self.controlnet_down_blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANTID_CONFIG: &str = r#"{
        "_class_name": "ControlNetModel",
        "addition_embed_type": "text_time",
        "attention_head_dim": [5, 10, 20],
        "block_out_channels": [320, 640, 1280],
        "conditioning_embedding_out_channels": [16, 32, 96, 256],
        "cross_attention_dim": 2048,
        "down_block_types": ["DownBlock2D", "CrossAttnDownBlock2D", "CrossAttnDownBlock2D"],
        "flip_sin_to_cos": true,
        "freq_shift": 0,
        "in_channels": 4,
        "layers_per_block": 2,
        "num_attention_heads": null,
        "transformer_layers_per_block": [1, 2, 10],
        "use_linear_projection": true
    }"#;

    fn tiny_config() -> ControlNetConfig {
        serde_json::from_str(
            r#"{
                "attention_head_dim": 2,
                "block_out_channels": [32, 64],
                "conditioning_embedding_out_channels": [8, 16],
                "cross_attention_dim": 16,
                "down_block_types": ["DownBlock2D", "CrossAttnDownBlock2D"],
                "norm_num_groups": 8,
                "use_linear_projection": true
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_diffusers_config() {
        let config: ControlNetConfig = serde_json::from_str(INSTANTID_CONFIG).unwrap();
        assert_eq!(config.block_out_channels, vec![320, 640, 1280]);
        assert_eq!(config.heads(2).unwrap(), 20);
        assert_eq!(config.transformer_layers_per_block.get(1).unwrap(), 2);
        assert_eq!(config.norm_num_groups, 32);
        assert_eq!(config.freq_shift, 0.0);
        assert!(config.num_attention_heads.is_none());
    }

    #[test]
    fn uniform_settings_apply_to_every_block() {
        let config = tiny_config();
        assert_eq!(config.heads(0).unwrap(), 2);
        assert_eq!(config.heads(7).unwrap(), 2);
        assert_eq!(config.transformer_layers_per_block.get(1).unwrap(), 1);
        assert!(PerBlock::Each(vec![1]).get(3).is_err());
    }

    #[test]
    fn residuals_line_up_with_unet_skips() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ControlNetModel::new(vb, &tiny_config(), false)?;

        // conv_in + 2 resnets + downsample + 2 resnets
        assert_eq!(model.num_down_residuals(), 6);

        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?;
        let context = Tensor::zeros((2, 5, 16), DType::F32, &device)?;
        let cond = Tensor::zeros((2, 3, 16, 16), DType::F32, &device)?;

        let out = model.forward(&latents, 999.0, &context, &cond, 1.0)?;
        assert_eq!(out.down_residuals.len(), 6);
        assert_eq!(out.down_residuals[0].dims(), &[2, 32, 8, 8]);
        assert_eq!(out.down_residuals[3].dims(), &[2, 32, 4, 4]);
        assert_eq!(out.down_residuals[5].dims(), &[2, 64, 4, 4]);
        assert_eq!(out.mid_residual.dims(), &[2, 64, 4, 4]);
        Ok(())
    }
}
