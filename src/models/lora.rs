//! LoRA network
//!
//! One low-rank `down`/`up` pair per targeted linear layer. The model asks the
//! network for a delta (`scale * multiplier * up(down(x))`) and adds it to the
//! frozen layer's output.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::NetworkConfig;
use crate::error::TrainerError;
use crate::models::LoraTarget;
use crate::trainers::checkpoint::write_safetensors;

pub struct LoraModule {
    pub down: Var,
    pub up: Var,
    pub scale: f64,
    pub normalize_scaler: f64,
}

impl LoraModule {
    pub fn new(in_features: usize, out_features: usize, rank: usize, alpha: f32, device: &Device, dtype: DType) -> Result<Self> {
        let down = Tensor::randn(0.0f32, 0.02, (rank, in_features), device)?.to_dtype(dtype)?;
        let up = Tensor::zeros((out_features, rank), dtype, device)?;
        Ok(Self {
            down: Var::from_tensor(&down)?,
            up: Var::from_tensor(&up)?,
            scale: (alpha / rank as f32) as f64,
            normalize_scaler: 1.0,
        })
    }

    pub fn in_features(&self) -> usize {
        self.down.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.up.dims()[0]
    }

    /// `scale * multiplier * up(down(x))` for `x` of shape `[.., in_features]`.
    pub fn forward(&self, input: &Tensor, multiplier: f32) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let in_features = *dims.last().context("LoRA input has no feature dimension")?;
        let rows = input.elem_count() / in_features.max(1);
        let input_2d = input.reshape((rows, in_features))?;

        let down_out = input_2d.matmul(&self.down.as_tensor().t()?)?;
        let out_2d = down_out.matmul(&self.up.as_tensor().t()?)?;

        let mut out_shape = dims;
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        let factor = self.scale * self.normalize_scaler * multiplier as f64;
        Ok((out_2d.reshape(out_shape)? * factor)?)
    }

    /// Frobenius norm of the effective weight delta `scale * up @ down`.
    fn delta_norm(&self) -> Result<f64> {
        let delta = self.up.as_tensor().matmul(self.down.as_tensor())?.to_dtype(DType::F32)?;
        let norm = delta.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
        Ok(norm * self.scale)
    }

    pub fn vars(&self) -> Vec<&Var> {
        vec![&self.down, &self.up]
    }
}

pub struct LoraNetwork {
    modules: BTreeMap<String, LoraModule>,
    pub rank: usize,
    pub alpha: f32,
    pub multiplier: f32,
    /// Fold the normalizer into the weights after each optimizer step.
    pub is_normalizing: bool,
    dtype: DType,
}

impl LoraNetwork {
    pub fn new(config: &NetworkConfig, dtype: DType) -> Self {
        Self {
            modules: BTreeMap::new(),
            rank: config.linear,
            alpha: config.linear_alpha,
            multiplier: 1.0,
            is_normalizing: false,
            dtype,
        }
    }

    /// Create a fresh module for every target layer.
    pub fn from_targets(config: &NetworkConfig, targets: &[LoraTarget], device: &Device, dtype: DType) -> Result<Self> {
        let mut network = Self::new(config, dtype);
        for target in targets {
            network.add(&target.name, target.in_features, target.out_features, device)?;
        }
        info!(
            "Created LoRA network: {} modules, rank {}, alpha {}",
            network.len(),
            network.rank,
            network.alpha
        );
        Ok(network)
    }

    pub fn add(&mut self, name: &str, in_features: usize, out_features: usize, device: &Device) -> Result<()> {
        self.modules.insert(
            name.to_string(),
            LoraModule::new(in_features, out_features, self.rank, self.alpha, device, self.dtype)?,
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LoraModule> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(|k| k.as_str())
    }

    /// Delta for layer `name`, or `None` when the layer carries no module.
    pub fn forward(&self, name: &str, input: &Tensor) -> Result<Option<Tensor>> {
        match self.modules.get(name) {
            Some(module) => Ok(Some(module.forward(input, self.multiplier)?)),
            None => Ok(None),
        }
    }

    /// `x @ weight^T + bias` plus the layer's delta when one exists.
    pub fn apply(&self, name: &str, input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let mut output = input.broadcast_matmul(&weight.t()?)?;
        if let Some(bias) = bias {
            output = output.broadcast_add(bias)?;
        }
        match self.forward(name, input)? {
            Some(delta) => Ok((output + delta)?),
            None => Ok(output),
        }
    }

    pub fn vars(&self) -> Vec<&Var> {
        self.modules.values().flat_map(|m| m.vars()).collect()
    }

    /// Variables handed to the optimizer. `Var` clones share storage.
    pub fn prepare_optimizer_params(&self) -> Vec<Var> {
        self.vars().into_iter().cloned().collect()
    }

    /// Refresh every module's scaler so its effective delta norm stays at or below 1.
    pub fn update_normalizers(&mut self) -> Result<()> {
        for module in self.modules.values_mut() {
            let norm = module.delta_norm()?;
            module.normalize_scaler = if norm > 1.0 { 1.0 / norm } else { 1.0 };
        }
        Ok(())
    }

    /// Fold each module's scaler into its `up` weights and reset it to 1.
    pub fn apply_stored_normalizer(&mut self) -> Result<()> {
        let mut applied = 0;
        for module in self.modules.values_mut() {
            if (module.normalize_scaler - 1.0).abs() > f64::EPSILON {
                let scaled = (module.up.as_tensor() * module.normalize_scaler)?;
                module.up.set(&scaled)?;
                module.normalize_scaler = 1.0;
                applied += 1;
            }
        }
        if applied > 0 {
            debug!("Applied stored normalizer to {} LoRA modules", applied);
        }
        Ok(())
    }

    fn key_base(name: &str) -> String {
        format!("lora_{}", name.replace('.', "_"))
    }

    /// Write all modules as `lora_<name>.lora_down.weight` / `.lora_up.weight` / `.alpha`.
    pub fn save_weights(&self, path: &Path, dtype: DType, metadata: &HashMap<String, String>) -> Result<()> {
        let mut tensors = Vec::with_capacity(self.modules.len() * 3);
        for (name, module) in &self.modules {
            let key = Self::key_base(name);
            tensors.push((format!("{}.lora_down.weight", key), module.down.as_tensor().to_dtype(dtype)?));
            tensors.push((format!("{}.lora_up.weight", key), module.up.as_tensor().to_dtype(dtype)?));
            let alpha = Tensor::new(self.alpha, module.down.device())?.to_dtype(dtype)?;
            tensors.push((format!("{}.alpha", key), alpha));
        }

        let mut metadata = metadata.clone();
        metadata.insert("ss_network_module".to_string(), "networks.lora".to_string());
        metadata.insert("ss_network_dim".to_string(), self.rank.to_string());
        metadata.insert("ss_network_alpha".to_string(), self.alpha.to_string());
        write_safetensors(path, &tensors, &metadata)
    }

    /// Load weights written by [`save_weights`](Self::save_weights) into the existing modules.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        let device = match self.modules.values().next() {
            Some(module) => module.down.device().clone(),
            None => return Ok(()),
        };
        let tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("Failed to read LoRA weights: {}", path.display()))?;

        for (name, module) in self.modules.iter_mut() {
            let key = Self::key_base(name);
            for (suffix, var) in [("lora_down.weight", &module.down), ("lora_up.weight", &module.up)] {
                let full_key = format!("{}.{}", key, suffix);
                let tensor = tensors.get(&full_key).ok_or_else(|| {
                    TrainerError::Checkpoint(format!("{} is missing {}", path.display(), full_key))
                })?;
                if tensor.dims() != var.dims() {
                    return Err(TrainerError::Checkpoint(format!(
                        "{}: {} has shape {:?}, expected {:?}",
                        path.display(),
                        full_key,
                        tensor.dims(),
                        var.dims()
                    ))
                    .into());
                }
                var.set(&tensor.to_dtype(self.dtype)?)?;
            }
            module.normalize_scaler = 1.0;
        }
        info!("Loaded {} LoRA modules from {}", self.modules.len(), path.display());
        Ok(())
    }
}
