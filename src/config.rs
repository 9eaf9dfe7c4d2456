//! Job configuration
//!
//! Mirrors the YAML layout used by the trainers: a job with a list of
//! processes, each carrying train/model/save/sample/logging/network/embedding
//! sections and a list of datasets. Every section has defaults, so a config
//! only needs to spell out what it changes. Parsed once, validated, then
//! treated as read-only.

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::config_error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: String,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub process_type: String,
    pub training_folder: PathBuf,
    pub device: String,
    pub trigger_word: Option<String>,
    pub network: Option<NetworkConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub train: TrainConfig,
    pub model: ModelConfig,
    pub save: SaveConfig,
    pub sample: SampleConfig,
    pub first_sample: Option<SampleConfig>,
    pub logging: LoggingConfig,
    pub datasets: Vec<DatasetConfig>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            process_type: "sd_trainer".to_string(),
            training_folder: PathBuf::from("output"),
            device: "cpu".to_string(),
            trigger_word: None,
            network: None,
            embedding: None,
            train: TrainConfig::default(),
            model: ModelConfig::default(),
            save: SaveConfig::default(),
            sample: SampleConfig::default(),
            first_sample: None,
            logging: LoggingConfig::default(),
            datasets: Vec::new(),
        }
    }
}

impl ProcessConfig {
    /// Check the cross-field rules. Called once before anything is built.
    pub fn validate(&self) -> Result<()> {
        if self.network.is_some() && self.embedding.is_some() {
            return config_error("`network` and `embedding` are mutually exclusive; pick one training mode");
        }
        if self.train.batch_size == 0 {
            return config_error("train.batch_size must be at least 1");
        }
        if self.train.steps == 0 {
            return config_error("train.steps must be at least 1");
        }
        if self.train.max_denoising_steps == 0 {
            return config_error("train.max_denoising_steps must be at least 1");
        }
        if self.save.max_step_saves_to_keep == 0 {
            return config_error("save.max_step_saves_to_keep must be at least 1");
        }
        parse_dtype(&self.train.dtype)?;
        parse_dtype(&self.save.dtype)?;
        if self.model.is_v2 && self.model.is_xl {
            return config_error("model.is_v2 and model.is_xl are mutually exclusive");
        }
        if self.sample.sampler.trim().is_empty() {
            return config_error("sample.sampler must name a scheduler");
        }

        if !self.datasets.iter().any(|d| !d.is_reg) {
            return config_error("at least one non-regularization dataset is required");
        }
        for dataset in &self.datasets {
            dataset.validate()?;
        }
        if let Some(embedding) = &self.embedding {
            if embedding.trigger.trim().is_empty() {
                return config_error("embedding.trigger is required when training an embedding");
            }
            if embedding.tokens == 0 {
                return config_error("embedding.tokens must be at least 1");
            }
        }
        if let Some(network) = &self.network {
            if network.linear == 0 {
                return config_error("network.linear (rank) must be at least 1");
            }
            if network.network_type != "lora" {
                return config_error(format!("unsupported network type: {}", network.network_type));
            }
            if network.conv.is_some() || network.conv_alpha.is_some() {
                return config_error("conv LoRA layers are not supported; remove network.conv and network.conv_alpha");
            }
        }
        Ok(())
    }

    /// `<training_folder>/<job_name>`
    pub fn save_root(&self, job_name: &str) -> PathBuf {
        self.training_folder.join(job_name)
    }

    pub fn primary_datasets(&self) -> Vec<DatasetConfig> {
        self.datasets.iter().filter(|d| !d.is_reg).cloned().collect()
    }

    pub fn reg_datasets(&self) -> Vec<DatasetConfig> {
        self.datasets.iter().filter(|d| d.is_reg).cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub network_type: String,
    pub linear: usize,
    pub linear_alpha: f32,
    pub conv: Option<usize>,
    pub conv_alpha: Option<f32>,
    pub normalize: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_type: "lora".to_string(),
            linear: 4,
            linear_alpha: 1.0,
            conv: None,
            conv_alpha: None,
            normalize: false,
        }
    }
}

/// Checkpoint container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    Safetensors,
    Npz,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Safetensors => "safetensors",
            SaveFormat::Npz => "npz",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "safetensors" => Some(SaveFormat::Safetensors),
            "npz" => Some(SaveFormat::Npz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Placeholder word the embedding is trained for
    pub trigger: String,
    /// Number of vectors behind the placeholder
    pub tokens: usize,
    /// Words whose encoding seeds the vectors
    pub init_words: String,
    pub save_format: SaveFormat,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            trigger: String::new(),
            tokens: 4,
            init_words: "*".to_string(),
            save_format: SaveFormat::Safetensors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub steps: usize,
    pub lr: f64,
    pub optimizer: String,
    pub weight_decay: f64,
    pub lr_scheduler: String,
    pub lr_warmup_steps: usize,
    pub dtype: String,
    pub train_unet: bool,
    pub train_text_encoder: bool,
    pub noise_offset: f32,
    pub min_snr_gamma: Option<f32>,
    pub max_denoising_steps: usize,
    pub skip_first_sample: bool,
    /// Data loader worker threads; 0 loads on the training thread.
    pub num_workers: Option<usize>,
    /// Batches queued per worker.
    pub prefetch_factor: usize,
    /// Drop the under-full trailing batch of a non-bucketed epoch.
    pub drop_last: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            steps: 1000,
            lr: 1e-6,
            optimizer: "adamw".to_string(),
            weight_decay: 0.01,
            lr_scheduler: "constant".to_string(),
            lr_warmup_steps: 0,
            dtype: "fp32".to_string(),
            train_unet: true,
            train_text_encoder: true,
            noise_offset: 0.0,
            min_snr_gamma: None,
            max_denoising_steps: 1000,
            skip_first_sample: false,
            num_workers: None,
            prefetch_factor: 2,
            drop_last: false,
        }
    }
}

impl TrainConfig {
    pub fn worker_count(&self) -> usize {
        self.num_workers.unwrap_or_else(|| num_cpus::get().min(2))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name_or_path: String,
    pub is_v2: bool,
    pub is_xl: bool,
    pub is_v_pred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub dtype: String,
    pub save_every: usize,
    pub max_step_saves_to_keep: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            dtype: "float16".to_string(),
            save_every: 1000,
            max_step_saves_to_keep: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub sampler: String,
    pub sample_every: usize,
    pub width: usize,
    pub height: usize,
    pub prompts: Vec<String>,
    pub neg: String,
    pub seed: u64,
    pub walk_seed: bool,
    pub guidance_scale: f32,
    pub guidance_rescale: f32,
    pub sample_steps: usize,
    pub network_multiplier: f32,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sampler: "ddpm".to_string(),
            sample_every: 100,
            width: 512,
            height: 512,
            prompts: Vec::new(),
            neg: String::new(),
            seed: 0,
            walk_seed: false,
            guidance_scale: 7.0,
            guidance_rescale: 0.0,
            sample_steps: 20,
            network_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_every: usize,
    pub verbose: bool,
    /// File under the save root receiving one JSON line per logged step.
    pub metrics_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_every: 100,
            verbose: false,
            metrics_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub folder_path: PathBuf,
    /// Caption file extension; `None` disables prompts for this dataset.
    pub caption_ext: Option<String>,
    pub default_caption: String,
    pub caption_dropout_rate: f32,
    pub shuffle_tokens: bool,
    pub resolution: u32,
    pub scale: f32,
    pub random_scale: bool,
    pub random_crop: bool,
    pub random_flip: bool,
    pub buckets: bool,
    pub bucket_tolerance: u32,
    pub is_reg: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_type: "image".to_string(),
            folder_path: PathBuf::new(),
            caption_ext: Some("txt".to_string()),
            default_caption: String::new(),
            caption_dropout_rate: 0.0,
            shuffle_tokens: false,
            resolution: 512,
            scale: 1.0,
            random_scale: false,
            random_crop: false,
            random_flip: false,
            buckets: false,
            bucket_tolerance: 64,
            is_reg: false,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dataset_type != "image" {
            return config_error(format!("invalid dataset type: {}", self.dataset_type));
        }
        if self.folder_path.as_os_str().is_empty() {
            return config_error("dataset folder_path is required");
        }
        if self.resolution == 0 {
            return config_error(format!(
                "dataset {} has resolution 0",
                self.folder_path.display()
            ));
        }
        if !(self.scale > 0.0) {
            return config_error(format!(
                "dataset {} needs a positive scale, got {}",
                self.folder_path.display(),
                self.scale
            ));
        }
        if self.bucket_tolerance == 0 {
            return config_error("bucket_tolerance must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.caption_dropout_rate) {
            return config_error("caption_dropout_rate must be within [0, 1]");
        }
        Ok(())
    }

    /// Random scaling always implies a random crop.
    pub fn uses_random_crop(&self) -> bool {
        self.random_scale || self.random_crop
    }
}

/// Map the dtype spellings accepted in configs onto candle dtypes.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "fp32" | "float32" | "float" => Ok(DType::F32),
        "fp16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => config_error(format!("unsupported dtype: {}", other)),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
        _ => serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
    };

    for process in &config.config.process {
        process.validate()?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainerError;

    const MINIMAL: &str = r#"
job: extension
config:
  name: my_lora
  process:
    - type: sd_trainer
      trigger_word: sks
      network:
        type: lora
        linear: 8
        linear_alpha: 8
      train:
        batch_size: 2
        steps: 50
      datasets:
        - folder_path: /data/photos
          resolution: 768
          buckets: true
        - folder_path: /data/reg
          is_reg: true
"#;

    fn is_config_error(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<TrainerError>(), Some(TrainerError::Configuration(_)))
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        let process = &config.config.process[0];
        process.validate().unwrap();

        assert_eq!(config.config.name, "my_lora");
        assert_eq!(process.train.batch_size, 2);
        assert_eq!(process.train.lr_scheduler, "constant");
        assert_eq!(process.save.max_step_saves_to_keep, 5);
        assert_eq!(process.network.as_ref().unwrap().linear, 8);
        assert_eq!(process.datasets[0].caption_ext.as_deref(), Some("txt"));
        assert_eq!(process.datasets[0].bucket_tolerance, 64);
        assert_eq!(process.primary_datasets().len(), 1);
        assert_eq!(process.reg_datasets().len(), 1);
        assert!(!process.train.drop_last);
    }

    #[test]
    fn test_network_and_embedding_are_exclusive() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        let process = &mut config.config.process[0];
        process.embedding = Some(EmbeddingConfig {
            trigger: "tok".to_string(),
            ..Default::default()
        });
        let err = process.validate().unwrap_err();
        assert!(is_config_error(&err));
    }

    #[test]
    fn test_invalid_dataset_type_rejected() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.config.process[0].datasets[0].dataset_type = "paired".to_string();
        let err = config.config.process[0].validate().unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("invalid dataset type"));
    }

    #[test]
    fn test_reg_only_datasets_rejected() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.config.process[0].datasets.retain(|d| d.is_reg);
        assert!(is_config_error(&config.config.process[0].validate().unwrap_err()));
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("float16").unwrap(), DType::F16);
        assert_eq!(parse_dtype("FP32").unwrap(), DType::F32);
        assert!(parse_dtype("int4").is_err());
    }

    #[test]
    fn test_save_format_extension() {
        assert_eq!(SaveFormat::Npz.extension(), "npz");
        assert_eq!(SaveFormat::from_extension("SafeTensors"), Some(SaveFormat::Safetensors));
        assert_eq!(SaveFormat::from_extension("pt"), None);
    }

    #[test]
    fn test_conv_lora_rejected() {
        let yaml = MINIMAL.replace("linear_alpha: 8", "linear_alpha: 8\n        conv: 8");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let process = &config.config.process[0];
        assert_eq!(process.network.as_ref().unwrap().conv, Some(8));
        let err = process.validate().unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("conv LoRA"));
    }

    #[test]
    fn test_model_section_parsed_and_checked() {
        let yaml = MINIMAL.replace(
            "      trigger_word: sks",
            "      trigger_word: sks\n      model:\n        name_or_path: stabilityai/sd-2-1\n        is_v2: true\n        is_v_pred: true",
        );
        let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
        let process = &mut config.config.process[0];
        process.validate().unwrap();
        assert_eq!(process.model.name_or_path, "stabilityai/sd-2-1");
        assert!(process.model.is_v2 && process.model.is_v_pred);

        process.model.is_xl = true;
        assert!(is_config_error(&process.validate().unwrap_err()));
    }

    #[test]
    fn test_empty_sampler_rejected() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.config.process[0].sample.sampler, "ddpm");
        config.config.process[0].sample.sampler = " ".to_string();
        assert!(is_config_error(&config.config.process[0].validate().unwrap_err()));
    }
}
