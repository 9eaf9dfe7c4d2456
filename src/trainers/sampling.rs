//! Sample image generation during training

use anyhow::Result;
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::config::SampleConfig;
use crate::data::image_ops::save_image;
use crate::data::PromptConditioner;
use crate::models::{DiffusionModel, Embedding, GenerateImageConfig};
use crate::trainers::step_hook::TrainingMethod;

/// `[time]_{step:09}_[count].png`
pub fn sample_file_name(time: &str, step: usize, count: usize) -> String {
    format!("{}_{:09}_{:02}.png", time, step, count)
}

pub struct Sampler {
    sample_folder: PathBuf,
    conditioner: PromptConditioner,
}

impl Sampler {
    pub fn new(save_root: &Path, conditioner: PromptConditioner) -> Self {
        Self {
            sample_folder: save_root.join("samples"),
            conditioner,
        }
    }

    pub fn sample_folder(&self) -> &Path {
        &self.sample_folder
    }

    /// One request per prompt, conditioned and seeded.
    pub fn build_requests(
        &self,
        config: &SampleConfig,
        step: usize,
        time: &str,
        embedding: Option<&Embedding>,
    ) -> Vec<GenerateImageConfig> {
        config
            .prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| GenerateImageConfig {
                prompt: self.conditioner.condition(prompt, false, embedding),
                negative_prompt: config.neg.clone(),
                width: config.width,
                height: config.height,
                seed: if config.walk_seed { config.seed + i as u64 } else { config.seed },
                guidance_scale: config.guidance_scale,
                guidance_rescale: config.guidance_rescale,
                num_inference_steps: config.sample_steps,
                sampler: config.sampler.clone(),
                network_multiplier: config.network_multiplier,
                output_path: self.sample_folder.join(sample_file_name(time, step, i)),
            })
            .collect()
    }

    /// Generate and save every configured prompt. The LoRA multiplier is set
    /// to the sample value for the pass and restored afterwards.
    pub fn sample(
        &self,
        model: &dyn DiffusionModel,
        method: &mut TrainingMethod,
        config: &SampleConfig,
        step: usize,
    ) -> Result<Vec<PathBuf>> {
        if config.prompts.is_empty() {
            debug!("No sample prompts configured, skipping sampling at step {}", step);
            return Ok(Vec::new());
        }
        let time = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let requests = self.build_requests(config, step, &time, method.adapters().embedding);
        info!("Generating {} samples at step {}", requests.len(), step);

        let prev_multiplier = method.network_mut().map(|network| {
            let prev = network.multiplier;
            network.multiplier = config.network_multiplier;
            prev
        });

        let result = self.generate_all(model, method, &requests);

        if let (Some(prev), Some(network)) = (prev_multiplier, method.network_mut()) {
            network.multiplier = prev;
        }
        result
    }

    fn generate_all(
        &self,
        model: &dyn DiffusionModel,
        method: &TrainingMethod,
        requests: &[GenerateImageConfig],
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(requests.len());
        for request in requests {
            let image = model.generate_image(request, method.adapters())?;
            save_image(&image, &request.output_path)?;
            written.push(request.output_path.clone());
        }
        Ok(written)
    }
}
