//! Checkpoint files: safetensors serialization, naming, retention and resume lookup.
//!
//! Periodic saves are `<job>_<step:09>.<ext>`, the final save is `<job>.<ext>`.
//! Every file carries a `training_info` metadata entry holding the step, which
//! becomes the start step when training resumes from it.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use log::info;
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::{ModelConfig, SaveFormat};
use crate::error::TrainerError;
use crate::models::{BaseModelVersion, DiffusionModel, Embedding, LoraNetwork};

pub const TRAINING_INFO_KEY: &str = "training_info";

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::U8 => Ok(SafeDtype::U8),
        DType::U32 => Ok(SafeDtype::U32),
        DType::I64 => Ok(SafeDtype::I64),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::U8 => flattened.to_vec1::<u8>()?,
        DType::U32 => {
            let data: Vec<u32> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        DType::I64 => {
            let data: Vec<i64> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        other => return Err(anyhow::anyhow!("Unsupported tensor dtype for conversion: {:?}", other)),
    };
    Ok(data)
}

/// `<path>.tmp`, the staging name used before a checkpoint is moved into place.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn replace_file(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path)
        .with_context(|| format!("Failed to move {} into place at {}", tmp.display(), path.display()))
}

/// Serialize `tensors` with `metadata` in the header. Parent directories are created.
pub fn write_safetensors(path: &Path, tensors: &[(String, Tensor)], metadata: &HashMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create checkpoint directory: {}", parent.display()))?;
    }

    let mut tensor_data = Vec::with_capacity(tensors.len());
    for (_, tensor) in tensors {
        tensor_data.push(tensor_to_vec(tensor)?);
    }

    let mut views = HashMap::new();
    for ((name, tensor), data) in tensors.iter().zip(tensor_data.iter()) {
        views.insert(
            name.clone(),
            TensorView::new(convert_dtype(tensor.dtype())?, tensor.dims().to_vec(), data)?,
        );
    }

    let bytes = serialize(&views, &Some(metadata.clone()))?;
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
    replace_file(&tmp, path)
}

/// Read only the header of a safetensors file and return its metadata map.
pub fn read_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let mut file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .with_context(|| format!("Failed to read safetensors header size: {}", path.display()))?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    if header_len > 100_000_000 {
        return Err(TrainerError::Checkpoint(format!("{} has an implausible header size", path.display())).into());
    }

    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)
        .with_context(|| format!("Failed to read safetensors header: {}", path.display()))?;
    let header: serde_json::Value = serde_json::from_slice(&header)
        .with_context(|| format!("Invalid safetensors header: {}", path.display()))?;

    let mut metadata = HashMap::new();
    if let Some(map) = header.get("__metadata__").and_then(|m| m.as_object()) {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                metadata.insert(key.clone(), value.to_string());
            }
        }
    }
    Ok(metadata)
}

/// Step recorded under `training_info`, if any.
pub fn step_from_metadata(metadata: &HashMap<String, String>) -> Option<usize> {
    let info: serde_json::Value = serde_json::from_str(metadata.get(TRAINING_INFO_KEY)?).ok()?;
    info.get("step")?.as_u64().map(|s| s as usize)
}

/// Step stored in a checkpoint file of either format.
pub fn read_saved_step(path: &Path) -> Result<Option<usize>> {
    match path.extension().and_then(|e| e.to_str()).and_then(SaveFormat::from_extension) {
        Some(SaveFormat::Safetensors) => Ok(step_from_metadata(&read_metadata(path)?)),
        Some(SaveFormat::Npz) => {
            let tensors = Tensor::read_npz(path).with_context(|| format!("Failed to read {}", path.display()))?;
            for (name, tensor) in tensors {
                if name == crate::models::embedding::NPZ_STEP_KEY {
                    let values = tensor.flatten_all()?.to_vec1::<i64>()?;
                    return Ok(values.first().map(|s| *s as usize));
                }
            }
            Ok(None)
        }
        None => Ok(None),
    }
}

pub fn training_metadata(step: usize, model: &ModelConfig, job_name: &str, kind: &str) -> HashMap<String, String> {
    let base_model = BaseModelVersion::from_config(model);
    let mut metadata = HashMap::new();
    metadata.insert(TRAINING_INFO_KEY.to_string(), serde_json::json!({ "step": step }).to_string());
    if !model.name_or_path.is_empty() {
        metadata.insert("ss_sd_model_name".to_string(), model.name_or_path.clone());
    }
    metadata.insert("ss_base_model_version".to_string(), base_model.as_str().to_string());
    if base_model.is_v2() {
        metadata.insert("ss_v2".to_string(), "true".to_string());
    }
    metadata.insert("ss_output_name".to_string(), job_name.to_string());
    metadata.insert("format".to_string(), kind.to_string());
    metadata
}

/// What a save call writes. Weights are borrowed for the duration of the call.
pub enum SaveTarget<'a> {
    Network(&'a mut LoraNetwork),
    Embedding(&'a Embedding, SaveFormat),
    Model(&'a dyn DiffusionModel),
}

impl SaveTarget<'_> {
    fn format(&self) -> SaveFormat {
        match self {
            SaveTarget::Embedding(_, format) => *format,
            _ => SaveFormat::Safetensors,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SaveTarget::Network(_) => "lora",
            SaveTarget::Embedding(..) => "embedding",
            SaveTarget::Model(_) => "full",
        }
    }
}

pub struct CheckpointManager {
    pub save_root: PathBuf,
    pub job_name: String,
    pub max_step_saves_to_keep: usize,
}

impl CheckpointManager {
    pub fn new(save_root: impl Into<PathBuf>, job_name: &str, max_step_saves_to_keep: usize) -> Self {
        Self {
            save_root: save_root.into(),
            job_name: job_name.to_string(),
            max_step_saves_to_keep,
        }
    }

    /// `<job>_<step:09>.<ext>` for a step save, `<job>.<ext>` for the final one.
    pub fn checkpoint_path(&self, step: Option<usize>, format: SaveFormat) -> PathBuf {
        let file_name = match step {
            Some(step) => format!("{}_{:09}.{}", self.job_name, step, format.extension()),
            None => format!("{}.{}", self.job_name, format.extension()),
        };
        self.save_root.join(file_name)
    }

    /// Step encoded in a step-save file name, `None` for anything else.
    pub fn parse_step(&self, file_name: &str) -> Option<usize> {
        let rest = file_name.strip_prefix(&self.job_name)?.strip_prefix('_')?;
        let (digits, ext) = rest.split_once('.')?;
        SaveFormat::from_extension(ext)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn is_final_save(&self, file_name: &str) -> bool {
        match file_name.strip_prefix(&self.job_name).and_then(|r| r.strip_prefix('.')) {
            Some(ext) => SaveFormat::from_extension(ext).is_some(),
            None => false,
        }
    }

    /// Tie-break for saves sharing a timestamp: step saves by step, the final save last.
    fn save_rank(&self, file_name: &str) -> usize {
        self.parse_step(file_name).unwrap_or(usize::MAX)
    }

    fn order_saves(&self, entries: &mut [(SystemTime, String, PathBuf)]) {
        entries.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| self.save_rank(&a.1).cmp(&self.save_rank(&b.1)))
                .then_with(|| a.1.cmp(&b.1))
        });
    }

    /// Files in the save root accepted by `keep`, oldest first.
    fn list_sorted(&self, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
        if !self.save_root.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(SystemTime, String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.save_root)
            .with_context(|| format!("Failed to list {}", self.save_root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !keep(&name) || !entry.file_type()?.is_file() {
                continue;
            }
            let meta = entry.metadata()?;
            let created = meta.created().or_else(|_| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((created, name, entry.path()));
        }
        self.order_saves(&mut entries);
        Ok(entries.into_iter().map(|(_, _, path)| path).collect())
    }

    pub fn step_saves(&self) -> Result<Vec<PathBuf>> {
        self.list_sorted(|name| self.parse_step(name).is_some())
    }

    /// Delete the oldest step saves beyond the retention limit. Returns the removed files.
    pub fn clean_up_saves(&self) -> Result<Vec<PathBuf>> {
        let saves = self.step_saves()?;
        if saves.len() <= self.max_step_saves_to_keep {
            return Ok(Vec::new());
        }
        let excess = saves.len() - self.max_step_saves_to_keep;
        let removed: Vec<PathBuf> = saves.into_iter().take(excess).collect();
        remove_saves(&removed)?;
        Ok(removed)
    }

    /// Most recently created step save or final save, if any.
    pub fn latest_save_path(&self) -> Result<Option<PathBuf>> {
        let saves = self.list_sorted(|name| self.parse_step(name).is_some() || self.is_final_save(name))?;
        Ok(saves.into_iter().last())
    }

    /// Write a checkpoint, then apply retention.
    ///
    /// `file_step` picks the file name (`None` for the final save) and
    /// `recorded_step` is what resuming from the file will start at.
    pub fn save(
        &self,
        file_step: Option<usize>,
        recorded_step: usize,
        target: SaveTarget<'_>,
        dtype: DType,
        model_config: &ModelConfig,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.save_root)
            .with_context(|| format!("Failed to create save directory: {}", self.save_root.display()))?;

        let path = self.checkpoint_path(file_step, target.format());
        let metadata = training_metadata(recorded_step, model_config, &self.job_name, target.kind());

        match target {
            SaveTarget::Network(network) => {
                let prev_multiplier = network.multiplier;
                network.multiplier = 1.0;
                if network.is_normalizing {
                    network.apply_stored_normalizer()?;
                }
                let result = network.save_weights(&path, dtype, &metadata);
                network.multiplier = prev_multiplier;
                result?;
            }
            SaveTarget::Embedding(embedding, format) => {
                embedding.save(&path, format, dtype, &metadata)?;
            }
            SaveTarget::Model(model) => {
                model.save_weights(&path, dtype, &metadata)?;
            }
        }
        info!("Saved to {}", path.display());

        self.clean_up_saves()?;
        Ok(path)
    }
}

fn remove_saves(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        info!("Removing old save: {}", path.display());
        fs::remove_file(path).with_context(|| format!("Failed to remove old save: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::models::LoraTarget;
    use candle_core::Device;

    fn sd15() -> ModelConfig {
        ModelConfig::default()
    }

    fn network() -> LoraNetwork {
        let targets = vec![LoraTarget { name: "unet.proj".to_string(), in_features: 4, out_features: 4 }];
        LoraNetwork::from_targets(&NetworkConfig::default(), &targets, &Device::Cpu, DType::F32).unwrap()
    }

    #[test]
    fn test_checkpoint_names() {
        let manager = CheckpointManager::new("/tmp/out/job", "job", 3);
        assert_eq!(
            manager.checkpoint_path(Some(250), SaveFormat::Safetensors),
            PathBuf::from("/tmp/out/job/job_000000250.safetensors")
        );
        assert_eq!(manager.checkpoint_path(None, SaveFormat::Npz), PathBuf::from("/tmp/out/job/job.npz"));
    }

    #[test]
    fn test_parse_step_is_exact() {
        let manager = CheckpointManager::new("/tmp", "job", 3);
        assert_eq!(manager.parse_step("job_000000250.safetensors"), Some(250));
        assert_eq!(manager.parse_step("job_000000250.npz"), Some(250));
        assert_eq!(manager.parse_step("job.safetensors"), None);
        assert_eq!(manager.parse_step("job_v2_000000250.safetensors"), None);
        assert_eq!(manager.parse_step("job_000000250.safetensors.tmp"), None);
        assert_eq!(manager.parse_step("job_12.txt"), None);
        assert!(manager.is_final_save("job.safetensors"));
        assert!(!manager.is_final_save("job_2.safetensors"));
    }

    #[test]
    fn test_metadata_step_round_trip() {
        let model = ModelConfig { name_or_path: "sd2/base".to_string(), is_v2: true, ..Default::default() };
        let metadata = training_metadata(1234, &model, "job", "lora");
        assert_eq!(step_from_metadata(&metadata), Some(1234));
        assert_eq!(metadata.get("ss_v2").map(String::as_str), Some("true"));
        assert_eq!(metadata.get("ss_base_model_version").map(String::as_str), Some("sd_2.1"));
        assert_eq!(metadata.get("ss_sd_model_name").map(String::as_str), Some("sd2/base"));
        assert_eq!(step_from_metadata(&HashMap::new()), None);
        assert!(!training_metadata(1, &sd15(), "job", "lora").contains_key("ss_sd_model_name"));
    }

    #[test]
    fn test_retention_keeps_newest_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("job"), "job", 2);
        let mut net = network();

        for step in [10, 20, 30, 40] {
            manager
                .save(Some(step), step, SaveTarget::Network(&mut net), DType::F32, &sd15())
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        manager
            .save(None, 50, SaveTarget::Network(&mut net), DType::F32, &sd15())
            .unwrap();

        let names: Vec<String> = manager
            .step_saves()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["job_000000030.safetensors", "job_000000040.safetensors"]);
        assert!(manager.checkpoint_path(None, SaveFormat::Safetensors).exists());

        let latest = manager.latest_save_path().unwrap().unwrap();
        assert_eq!(latest, manager.checkpoint_path(None, SaveFormat::Safetensors));
        assert_eq!(read_saved_step(&latest).unwrap(), Some(50));
    }

    #[test]
    fn test_other_job_files_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "job", 1);
        fs::write(dir.path().join("job_v2_000000001.safetensors"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let mut net = network();
        for step in [1, 2] {
            manager
                .save(Some(step), step, SaveTarget::Network(&mut net), DType::F32, &sd15())
                .unwrap();
        }
        assert!(dir.path().join("job_v2_000000001.safetensors").exists());
        assert_eq!(manager.step_saves().unwrap().len(), 1);
    }

    #[test]
    fn test_save_restores_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "job", 5);
        let mut net = network();
        net.multiplier = 0.3;
        manager
            .save(Some(1), 1, SaveTarget::Network(&mut net), DType::F16, &ModelConfig { is_xl: true, ..Default::default() })
            .unwrap();
        assert_eq!(net.multiplier, 0.3);
        let metadata = read_metadata(&manager.checkpoint_path(Some(1), SaveFormat::Safetensors)).unwrap();
        assert_eq!(metadata.get("format").map(String::as_str), Some("lora"));
        assert_eq!(metadata.get("ss_output_name").map(String::as_str), Some("job"));
        assert_eq!(metadata.get("ss_base_model_version").map(String::as_str), Some("sdxl_1.0"));
    }

    #[test]
    fn test_same_timestamp_orders_final_save_last() {
        let manager = CheckpointManager::new("/tmp/out/job", "job", 5);
        let now = SystemTime::now();
        let mut entries: Vec<(SystemTime, String, PathBuf)> =
            ["job.safetensors", "job_000000010.safetensors", "job_000000004.safetensors"]
                .iter()
                .map(|name| (now, name.to_string(), PathBuf::from(name)))
                .collect();
        manager.order_saves(&mut entries);
        let names: Vec<&str> = entries.iter().map(|(_, name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["job_000000004.safetensors", "job_000000010.safetensors", "job.safetensors"]);

        let earlier = now - std::time::Duration::from_secs(1);
        let mut entries = vec![
            (now, "job_000000004.safetensors".to_string(), PathBuf::new()),
            (earlier, "job.safetensors".to_string(), PathBuf::new()),
        ];
        manager.order_saves(&mut entries);
        assert_eq!(entries[1].1, "job_000000004.safetensors");
    }

    #[test]
    fn test_back_to_back_final_save_is_latest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "job", 5);
        let mut net = network();
        manager
            .save(Some(4), 4, SaveTarget::Network(&mut net), DType::F32, &sd15())
            .unwrap();
        manager
            .save(None, 6, SaveTarget::Network(&mut net), DType::F32, &sd15())
            .unwrap();
        let latest = manager.latest_save_path().unwrap().unwrap();
        assert_eq!(latest, manager.checkpoint_path(None, SaveFormat::Safetensors));
        assert_eq!(read_saved_step(&latest).unwrap(), Some(6));
    }

    #[test]
    fn test_failed_removal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("job_000000001.safetensors");
        let err = remove_saves(&[missing]).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to remove old save"));
    }

    #[test]
    fn test_empty_root_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("missing"), "job", 5);
        assert!(manager.latest_save_path().unwrap().is_none());
        assert!(manager.clean_up_saves().unwrap().is_empty());
    }
}
