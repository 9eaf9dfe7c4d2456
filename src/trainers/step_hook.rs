//! Per-mode training strategy
//!
//! The loop driver owns exactly one [`TrainingMethod`]: a LoRA network, a
//! textual-inversion embedding, or the model's own weights. Everything that
//! differs between the modes (what is trained, what is saved, which hooks
//! run) goes through it; the noise-prediction loss is shared.

use anyhow::Result;
use candle_core::{DType, Tensor, Var, D};
use log::{debug, info};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{EmbeddingConfig, NetworkConfig, ProcessConfig, SaveFormat, TrainConfig};
use crate::data::{Batch, PromptConditioner};
use crate::error::config_error;
use crate::models::{Adapters, DiffusionModel, Embedding, LoraNetwork, PredictionType};
use crate::trainers::checkpoint::{read_saved_step, SaveTarget};
use crate::trainers::ddpm_scheduler::compute_snr_loss_weights;

/// Scalar loss plus whatever the mode wants logged.
pub struct StepLoss {
    pub loss: Tensor,
    pub metrics: BTreeMap<String, f32>,
}

/// Shared inputs of one step's loss computation.
pub struct StepContext<'a> {
    pub train: &'a TrainConfig,
    pub conditioner: &'a PromptConditioner,
    pub prediction_type: PredictionType,
}

/// Noised latents and everything needed to score a prediction against them.
pub struct NoisyBatch {
    pub latents: Tensor,
    pub noise: Tensor,
    pub noisy_latents: Tensor,
    pub timesteps: Tensor,
    pub prompts: Vec<String>,
}

/// Condition the prompts, encode the images and noise them at random timesteps.
pub fn process_general_training_batch(
    model: &dyn DiffusionModel,
    batch: &Batch,
    ctx: &StepContext<'_>,
    adapters: Adapters<'_>,
) -> Result<NoisyBatch> {
    let batch_size = batch.len();
    let raw_prompts = batch.prompts.clone().unwrap_or_else(|| vec![String::new(); batch_size]);
    let prompts = raw_prompts
        .iter()
        .zip(batch.is_reg.iter())
        .map(|(prompt, &is_reg)| ctx.conditioner.condition(prompt, is_reg, adapters.embedding))
        .collect();

    let images = batch.images.to_device(model.device())?.to_dtype(model.dtype())?;
    let (_, _, height, width) = images.dims4()?;
    let latents = model.encode_images(&images)?.detach();
    let noise = model.get_latent_noise(height, width, batch_size, ctx.train.noise_offset)?;

    let scheduler = model.noise_scheduler();
    let max_timestep = ctx.train.max_denoising_steps.min(scheduler.num_train_timesteps()).max(1);
    let mut rng = rand::thread_rng();
    let timesteps: Vec<i64> = (0..batch_size).map(|_| rng.gen_range(0..max_timestep) as i64).collect();
    let timesteps = Tensor::from_vec(timesteps, batch_size, model.device())?;

    let noisy_latents = scheduler.add_noise(&latents, &noise, &timesteps)?.detach();
    Ok(NoisyBatch {
        latents,
        noise,
        noisy_latents,
        timesteps,
        prompts,
    })
}

/// MSE between the model's prediction and the noise (or velocity) target,
/// optionally min-SNR weighted per sample.
pub fn noise_prediction_loss(
    model: &dyn DiffusionModel,
    noisy: &NoisyBatch,
    ctx: &StepContext<'_>,
    adapters: Adapters<'_>,
) -> Result<StepLoss> {
    let embeds = noisy
        .prompts
        .iter()
        .map(|prompt| model.encode_prompt(prompt, adapters))
        .collect::<Result<Vec<_>>>()?;
    let conditioning = Tensor::cat(&embeds, 0)?;

    let pred = model.predict_noise(&noisy.noisy_latents, &conditioning, &noisy.timesteps, 1.0, adapters)?;
    let target = match ctx.prediction_type {
        PredictionType::VPrediction => {
            model
                .noise_scheduler()
                .get_velocity(&noisy.latents, &noisy.noise, &noisy.timesteps)?
        }
        PredictionType::Epsilon => noisy.noise.clone(),
    };

    let diff = (pred.to_dtype(DType::F32)? - target.to_dtype(DType::F32)?)?;
    let mut per_sample = diff.sqr()?.flatten_from(1)?.mean(D::Minus1)?;

    if let Some(gamma) = ctx.train.min_snr_gamma.filter(|g| *g > 1e-6) {
        let snr = model.noise_scheduler().get_snr(&noisy.timesteps)?;
        let weights = compute_snr_loss_weights(&snr.to_dtype(DType::F32)?, gamma)?.to_device(per_sample.device())?;
        per_sample = (per_sample * weights)?;
    }

    let loss = per_sample.mean_all()?;
    let mut metrics = BTreeMap::new();
    metrics.insert("loss".to_string(), loss.to_scalar::<f32>()?);
    Ok(StepLoss { loss, metrics })
}

/// Mode selected by the config, before any weights exist.
#[derive(Debug, Clone)]
pub enum TrainingMode {
    Lora(NetworkConfig),
    Embedding(EmbeddingConfig),
    Finetune,
}

impl TrainingMode {
    pub fn from_config(process: &ProcessConfig) -> Self {
        if let Some(network) = &process.network {
            TrainingMode::Lora(network.clone())
        } else if let Some(embedding) = &process.embedding {
            TrainingMode::Embedding(embedding.clone())
        } else {
            TrainingMode::Finetune
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrainingMode::Lora(_) => "lora",
            TrainingMode::Embedding(_) => "embedding",
            TrainingMode::Finetune => "finetune",
        }
    }

    pub fn before_model_load(&self) -> Result<()> {
        match self {
            TrainingMode::Lora(network) => info!(
                "Training LoRA network (rank {}, alpha {}{})",
                network.linear,
                network.linear_alpha,
                if network.normalize { ", normalized" } else { "" }
            ),
            TrainingMode::Embedding(embedding) => info!(
                "Training embedding \"{}\" with {} vectors",
                embedding.trigger, embedding.tokens
            ),
            TrainingMode::Finetune => info!("Finetuning model weights"),
        }
        Ok(())
    }

    /// Create the trainable weights against a loaded model.
    pub fn build(&self, model: &mut dyn DiffusionModel, train: &TrainConfig) -> Result<TrainingMethod> {
        match self {
            TrainingMode::Lora(config) => {
                let targets = model.lora_targets(train.train_unet, train.train_text_encoder);
                if targets.is_empty() {
                    return config_error("the model exposes no layers to attach a LoRA network to");
                }
                let network = LoraNetwork::from_targets(config, &targets, model.device(), model.dtype())?;
                Ok(TrainingMethod::Lora {
                    network,
                    normalize: config.normalize,
                })
            }
            TrainingMode::Embedding(config) => {
                let initial = model.initial_embedding(&config.init_words, config.tokens)?;
                check_initial_embedding(&initial, config.tokens, model.embedding_width())?;
                Ok(TrainingMethod::Embedding {
                    embedding: Embedding::new(&config.trigger, &initial)?,
                    format: config.save_format,
                })
            }
            TrainingMode::Finetune => {
                let vars = model.trainable_vars(train.train_unet, train.train_text_encoder)?;
                if vars.is_empty() {
                    return config_error("finetuning with nothing to train: enable train_unet or train_text_encoder");
                }
                Ok(TrainingMethod::Finetune { vars })
            }
        }
    }
}

fn check_initial_embedding(initial: &Tensor, tokens: usize, width: usize) -> Result<()> {
    if initial.dims() != [tokens, width] {
        return config_error(format!(
            "initial embedding has shape {:?}, expected [{}, {}]",
            initial.dims(),
            tokens,
            width
        ));
    }
    Ok(())
}

/// Trainable weights for the selected mode.
pub enum TrainingMethod {
    Lora { network: LoraNetwork, normalize: bool },
    Embedding { embedding: Embedding, format: SaveFormat },
    Finetune { vars: Vec<Var> },
}

impl TrainingMethod {
    pub fn adapters(&self) -> Adapters<'_> {
        match self {
            TrainingMethod::Lora { network, .. } => Adapters {
                network: Some(network),
                embedding: None,
            },
            TrainingMethod::Embedding { embedding, .. } => Adapters {
                network: None,
                embedding: Some(embedding),
            },
            TrainingMethod::Finetune { .. } => Adapters::default(),
        }
    }

    pub fn network_mut(&mut self) -> Option<&mut LoraNetwork> {
        match self {
            TrainingMethod::Lora { network, .. } => Some(network),
            _ => None,
        }
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            TrainingMethod::Lora { network, .. } => network.prepare_optimizer_params(),
            TrainingMethod::Embedding { embedding, .. } => embedding.vars(),
            TrainingMethod::Finetune { vars } => vars.clone(),
        }
    }

    pub fn before_train_loop(&mut self) -> Result<()> {
        if let TrainingMethod::Lora { network, normalize } = self {
            network.multiplier = 1.0;
            network.is_normalizing = *normalize;
            debug!("LoRA modules: {}", network.module_names().collect::<Vec<_>>().join(", "));
        }
        let count: usize = self.trainable_vars().iter().map(|v| v.elem_count()).sum();
        info!("Trainable parameters: {}", count);
        Ok(())
    }

    pub fn compute_step_loss(&self, model: &dyn DiffusionModel, batch: &Batch, ctx: &StepContext<'_>) -> Result<StepLoss> {
        let noisy = process_general_training_batch(model, batch, ctx, self.adapters())?;
        noise_prediction_loss(model, &noisy, ctx, self.adapters())
    }

    pub fn after_optimizer_step(&mut self) -> Result<()> {
        if let TrainingMethod::Lora { network, .. } = self {
            if network.is_normalizing {
                network.update_normalizers()?;
                network.apply_stored_normalizer()?;
            }
        }
        Ok(())
    }

    pub fn save_target<'a>(&'a mut self, model: &'a dyn DiffusionModel) -> SaveTarget<'a> {
        match self {
            TrainingMethod::Lora { network, .. } => SaveTarget::Network(network),
            TrainingMethod::Embedding { embedding, format } => SaveTarget::Embedding(embedding, *format),
            TrainingMethod::Finetune { .. } => SaveTarget::Model(model),
        }
    }

    /// Load weights from a checkpoint; returns the step it recorded.
    pub fn load_weights(&mut self, model: &mut dyn DiffusionModel, path: &Path) -> Result<Option<usize>> {
        match self {
            TrainingMethod::Lora { network, .. } => {
                network.load_weights(path)?;
                read_saved_step(path)
            }
            TrainingMethod::Embedding { embedding, .. } => {
                let device = embedding.vectors.device().clone();
                embedding.load_embedding_from_file(path, &device)
            }
            TrainingMethod::Finetune { .. } => {
                model.load_weights(path)?;
                read_saved_step(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainerError;
    use candle_core::Device;

    #[test]
    fn test_initial_embedding_must_match_encoder_width() {
        let initial = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        check_initial_embedding(&initial, 2, 8).unwrap();

        let err = check_initial_embedding(&initial, 2, 16).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainerError>(), Some(TrainerError::Configuration(_))));
        assert!(check_initial_embedding(&initial, 3, 8).is_err());
    }
}
