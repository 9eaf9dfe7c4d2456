//! Model-facing interfaces
//!
//! The trainer never looks inside the diffusion model. It drives it through
//! [`DiffusionModel`] and trains one of the adapter containers defined here:
//! a LoRA network, a textual-inversion embedding, or the model's own weights.

pub mod embedding;
pub mod lora;

pub use embedding::Embedding;
pub use lora::{LoraModule, LoraNetwork};

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ModelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

impl PredictionType {
    pub fn from_config(config: &ModelConfig) -> Self {
        if config.is_v_pred {
            PredictionType::VPrediction
        } else {
            PredictionType::Epsilon
        }
    }
}

/// Base model family, recorded in checkpoint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseModelVersion {
    SD15,
    SD21,
    SDXL,
}

impl BaseModelVersion {
    pub fn from_config(config: &ModelConfig) -> Self {
        if config.is_xl {
            BaseModelVersion::SDXL
        } else if config.is_v2 {
            BaseModelVersion::SD21
        } else {
            BaseModelVersion::SD15
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseModelVersion::SD15 => "sd_1.5",
            BaseModelVersion::SD21 => "sd_2.1",
            BaseModelVersion::SDXL => "sdxl_1.0",
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, BaseModelVersion::SD21)
    }
}

/// A linear layer the model is willing to host a LoRA module on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraTarget {
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

/// Trainable extras the model should route through during a forward pass.
#[derive(Clone, Copy, Default)]
pub struct Adapters<'a> {
    pub network: Option<&'a LoraNetwork>,
    pub embedding: Option<&'a Embedding>,
}

/// One image to generate while sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateImageConfig {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub guidance_scale: f32,
    pub guidance_rescale: f32,
    pub num_inference_steps: usize,
    /// Sampling scheduler name, passed through from the sample config
    pub sampler: String,
    pub network_multiplier: f32,
    pub output_path: PathBuf,
}

/// Forward diffusion schedule used to build training targets.
pub trait NoiseScheduler {
    fn num_train_timesteps(&self) -> usize;

    fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor>;

    fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor>;

    /// Signal-to-noise ratio per timestep, shape `[batch]`.
    fn get_snr(&self, timesteps: &Tensor) -> Result<Tensor>;
}

/// The diffusion model being fine-tuned.
///
/// Images handed to the model are `[B, 3, H, W]` in `[-1, 1]`. Implementations
/// own the VAE, the text encoder(s) and the denoiser, and must route every
/// forward pass through the [`Adapters`] they are given. Which checkpoint to
/// load and which family it belongs to come from [`ModelConfig`]; the trainer
/// takes the prediction type and checkpoint metadata from there too.
pub trait DiffusionModel {
    /// Load weights in `dtype` (`train.dtype`). Called once, after the mode's
    /// `before_model_load` hook.
    fn load_model(&mut self, dtype: DType) -> Result<()>;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    fn noise_scheduler(&self) -> &dyn NoiseScheduler;

    fn latent_channels(&self) -> usize {
        4
    }

    fn vae_scale_factor(&self) -> usize {
        8
    }

    fn encode_images(&self, images: &Tensor) -> Result<Tensor>;

    /// Encode one prompt to `[1, seq, dim]`. Expanding an embedding's
    /// placeholder into its sub-tokens happens here, not in the caller.
    fn encode_prompt(&self, prompt: &str, adapters: Adapters<'_>) -> Result<Tensor>;

    fn predict_noise(
        &self,
        latents: &Tensor,
        conditioning: &Tensor,
        timesteps: &Tensor,
        guidance_scale: f32,
        adapters: Adapters<'_>,
    ) -> Result<Tensor>;

    /// Gaussian latent noise for a batch of `pixel_height x pixel_width` images.
    /// `noise_offset` adds a per-channel constant shift.
    fn get_latent_noise(
        &self,
        pixel_height: usize,
        pixel_width: usize,
        batch_size: usize,
        noise_offset: f32,
    ) -> Result<Tensor> {
        let shape = (
            batch_size,
            self.latent_channels(),
            pixel_height / self.vae_scale_factor(),
            pixel_width / self.vae_scale_factor(),
        );
        let mut noise = Tensor::randn(0f32, 1f32, shape, self.device())?;
        if noise_offset > 0.0 {
            let offset = Tensor::randn(0f32, 1f32, (batch_size, self.latent_channels(), 1, 1), self.device())?;
            noise = noise.broadcast_add(&(offset * noise_offset as f64)?)?;
        }
        Ok(noise.to_dtype(self.dtype())?)
    }

    /// Layers a LoRA network may attach to.
    fn lora_targets(&self, train_unet: bool, train_text_encoder: bool) -> Vec<LoraTarget>;

    /// Width of one token embedding of the text encoder.
    fn embedding_width(&self) -> usize;

    /// Seed vectors for a new embedding, shape `[num_vectors, embedding_width]`.
    fn initial_embedding(&self, init_words: &str, num_vectors: usize) -> Result<Tensor>;

    /// Unfreeze and return the model's own weights for full finetuning.
    /// The returned `Var`s must be the ones the forward pass reads, so that
    /// `load_weights` can later `set` them in place on resume.
    fn trainable_vars(&mut self, train_unet: bool, train_text_encoder: bool) -> Result<Vec<Var>>;

    fn save_weights(&self, path: &Path, dtype: DType, metadata: &HashMap<String, String>) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;

    /// Generate one image, returned as `[3, H, W]` in `[-1, 1]`.
    fn generate_image(&self, config: &GenerateImageConfig, adapters: Adapters<'_>) -> Result<Tensor>;
}
