//! Textual-inversion embedding: a `[num_vectors, dim]` block of vectors bound
//! to one placeholder word.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::config::SaveFormat;
use crate::data::caption::inject_word;
use crate::error::TrainerError;
use crate::trainers::checkpoint::{read_metadata, replace_file, step_from_metadata, tmp_path, write_safetensors};

pub const EMBEDDING_KEY: &str = "emb_params";
pub const NPZ_STEP_KEY: &str = "training_info.step";

pub struct Embedding {
    /// Placeholder word used in prompts
    pub name: String,
    pub num_vectors: usize,
    pub vectors: Var,
    /// Step the vectors were last saved or loaded at
    pub step: usize,
}

impl Embedding {
    pub fn new(name: &str, initial: &Tensor) -> Result<Self> {
        let (num_vectors, _dim) = initial.dims2().context("embedding vectors must be 2-D")?;
        Ok(Self {
            name: name.to_string(),
            num_vectors,
            vectors: Var::from_tensor(&initial.to_dtype(DType::F32)?)?,
            step: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.vectors.dims()[1]
    }

    /// Sub-tokens the placeholder expands to inside the text encoder:
    /// `name`, `name_1`, ... `name_{n-1}`.
    pub fn placeholder_tokens(&self) -> Vec<String> {
        (0..self.num_vectors)
            .map(|i| if i == 0 { self.name.clone() } else { format!("{}_{}", self.name, i) })
            .collect()
    }

    /// Replace each standalone occurrence of the placeholder with its sub-tokens.
    /// Text encoders call this before tokenizing.
    pub fn expand_prompt(&self, prompt: &str) -> String {
        let expanded = self.placeholder_tokens().join(" ");
        prompt
            .split(' ')
            .map(|word| {
                let core = word.trim_end_matches([',', '.', ';', ':']);
                if core == self.name {
                    format!("{}{}", expanded, &word[core.len()..])
                } else {
                    word.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Put the placeholder into `prompt` without expanding it.
    pub fn inject_embedding_to_prompt(&self, prompt: &str, add_if_not_present: bool) -> String {
        inject_word(prompt, &self.name, add_if_not_present)
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.vectors.clone()]
    }

    pub fn save(&self, path: &Path, format: SaveFormat, dtype: DType, metadata: &HashMap<String, String>) -> Result<()> {
        let vectors = self.vectors.as_tensor().to_dtype(dtype)?;
        match format {
            SaveFormat::Safetensors => {
                let mut metadata = metadata.clone();
                metadata.insert("ti_placeholder".to_string(), self.name.clone());
                metadata.insert("ti_num_vectors".to_string(), self.num_vectors.to_string());
                write_safetensors(path, &[(EMBEDDING_KEY.to_string(), vectors)], &metadata)
            }
            SaveFormat::Npz => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let step = step_from_metadata(metadata).unwrap_or(self.step) as i64;
                let step = Tensor::new(&[step], vectors.device())?;
                let tmp = tmp_path(path);
                Tensor::write_npz(&[(EMBEDDING_KEY, &vectors), (NPZ_STEP_KEY, &step)], &tmp)
                    .with_context(|| format!("Failed to write embedding: {}", tmp.display()))?;
                replace_file(&tmp, path)
            }
        }
    }

    /// Replace the vectors with the ones stored at `path`; returns the saved step if recorded.
    pub fn load_embedding_from_file(&mut self, path: &Path, device: &Device) -> Result<Option<usize>> {
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(SaveFormat::from_extension)
            .ok_or_else(|| TrainerError::Checkpoint(format!("unknown embedding format: {}", path.display())))?;

        let (vectors, step) = match format {
            SaveFormat::Safetensors => {
                let mut tensors = candle_core::safetensors::load(path, device)
                    .with_context(|| format!("Failed to read embedding: {}", path.display()))?;
                let vectors = tensors.remove(EMBEDDING_KEY).ok_or_else(|| {
                    TrainerError::Checkpoint(format!("{} has no {} tensor", path.display(), EMBEDDING_KEY))
                })?;
                (vectors, step_from_metadata(&read_metadata(path)?))
            }
            SaveFormat::Npz => {
                let tensors = Tensor::read_npz(path)
                    .with_context(|| format!("Failed to read embedding: {}", path.display()))?;
                let mut vectors = None;
                let mut step = None;
                for (name, tensor) in tensors {
                    match name.as_str() {
                        EMBEDDING_KEY => vectors = Some(tensor.to_device(device)?),
                        NPZ_STEP_KEY => step = Some(tensor.flatten_all()?.to_vec1::<i64>()?.first().copied().unwrap_or(0) as usize),
                        _ => {}
                    }
                }
                let vectors = vectors.ok_or_else(|| {
                    TrainerError::Checkpoint(format!("{} has no {} array", path.display(), EMBEDDING_KEY))
                })?;
                (vectors, step)
            }
        };

        if vectors.dims() != self.vectors.dims() {
            return Err(TrainerError::Checkpoint(format!(
                "{}: embedding shape {:?} does not match {:?}",
                path.display(),
                vectors.dims(),
                self.vectors.dims()
            ))
            .into());
        }
        self.vectors.set(&vectors.to_dtype(DType::F32)?)?;
        if let Some(step) = step {
            self.step = step;
        }
        info!("Loaded embedding {} ({} vectors) from {}", self.name, self.num_vectors, path.display());
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::checkpoint::TRAINING_INFO_KEY;

    fn embedding() -> Embedding {
        let init = Tensor::arange(0f32, 12f32, &Device::Cpu).unwrap().reshape((3, 4)).unwrap();
        Embedding::new("my_tok", &init).unwrap()
    }

    #[test]
    fn test_placeholder_tokens() {
        let emb = embedding();
        assert_eq!(emb.placeholder_tokens(), vec!["my_tok", "my_tok_1", "my_tok_2"]);
        assert_eq!(emb.dim(), 4);
    }

    #[test]
    fn test_expand_prompt_whole_words_only() {
        let emb = embedding();
        assert_eq!(emb.expand_prompt("my_tok, a dog"), "my_tok my_tok_1 my_tok_2, a dog");
        assert_eq!(emb.expand_prompt("a my_tok_x dog"), "a my_tok_x dog");
        assert_eq!(emb.expand_prompt("a dog"), "a dog");
    }

    #[test]
    fn test_inject_is_not_expanded() {
        let emb = embedding();
        assert_eq!(emb.inject_embedding_to_prompt("a photo of [name]", true), "a photo of my_tok");
        assert_eq!(emb.inject_embedding_to_prompt("a dog", true), "my_tok a dog");
        assert_eq!(emb.inject_embedding_to_prompt("a dog", false), "a dog");
    }

    #[test]
    fn test_npz_round_trip_keeps_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb_000000042.npz");
        let emb = embedding();
        let mut metadata = HashMap::new();
        metadata.insert(TRAINING_INFO_KEY.to_string(), r#"{"step":42}"#.to_string());
        emb.save(&path, SaveFormat::Npz, DType::F32, &metadata).unwrap();

        let mut loaded = Embedding::new("my_tok", &Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let step = loaded.load_embedding_from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(step, Some(42));
        assert_eq!(loaded.step, 42);
        let values: Vec<f32> = loaded.vectors.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values[11], 11.0);
    }

    #[test]
    fn test_safetensors_round_trip_keeps_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb.safetensors");
        let mut metadata = HashMap::new();
        metadata.insert(TRAINING_INFO_KEY.to_string(), r#"{"step":7}"#.to_string());
        embedding().save(&path, SaveFormat::Safetensors, DType::F16, &metadata).unwrap();

        let mut loaded = Embedding::new("my_tok", &Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(loaded.load_embedding_from_file(&path, &Device::Cpu).unwrap(), Some(7));
    }

    #[test]
    fn test_shape_mismatch_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb.safetensors");
        embedding().save(&path, SaveFormat::Safetensors, DType::F32, &HashMap::new()).unwrap();

        let mut other = Embedding::new("my_tok", &Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let err = other.load_embedding_from_file(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainerError>(), Some(TrainerError::Checkpoint(_))));
    }
}
