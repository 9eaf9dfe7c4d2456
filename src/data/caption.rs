//! Captions and prompt conditioning

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::Path;

use crate::config::DatasetConfig;
use crate::logging::warn_once;
use crate::models::Embedding;

const PLACEHOLDERS: &[&str] = &["[name]", "[trigger]"];

/// Newlines become separators; entries are trimmed, empty ones dropped, and
/// the rest rejoined with ", ".
pub fn clean_caption(raw: &str) -> String {
    raw.replace("\r\n", ",")
        .replace(['\n', '\r'], ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Put `word` into `prompt`: placeholders are replaced, otherwise the word is
/// prepended when `add_if_not_present` is set.
pub fn inject_word(prompt: &str, word: &str, add_if_not_present: bool) -> String {
    let mut prompt = prompt.to_string();
    for placeholder in PLACEHOLDERS {
        prompt = prompt.replace(placeholder, word);
    }

    let occurrences = prompt.matches(word).count();
    if occurrences == 0 && add_if_not_present {
        prompt = if prompt.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", word, prompt)
        };
    } else if occurrences > 1 {
        warn_once(format!(
            "Prompt contains \"{}\" more than once. This may affect training results.",
            word
        ));
    }
    prompt
}

/// Reads the caption for an image and applies the dataset's caption policy.
#[derive(Debug, Clone)]
pub struct CaptionResolver {
    caption_ext: Option<String>,
    default_caption: String,
    caption_dropout_rate: f32,
    shuffle_tokens: bool,
}

impl CaptionResolver {
    pub fn from_config(config: &DatasetConfig) -> Self {
        Self {
            caption_ext: config.caption_ext.clone(),
            default_caption: config.default_caption.clone(),
            caption_dropout_rate: config.caption_dropout_rate,
            shuffle_tokens: config.shuffle_tokens,
        }
    }

    pub fn enabled(&self) -> bool {
        self.caption_ext.is_some()
    }

    /// Caption file contents (or the default caption), cleaned. `None` when
    /// captions are disabled.
    pub fn read_caption(&self, image_path: &Path) -> Result<Option<String>> {
        let Some(ext) = &self.caption_ext else {
            return Ok(None);
        };
        let caption_path = image_path.with_extension(ext);
        if caption_path.exists() {
            let raw = fs::read_to_string(&caption_path)
                .with_context(|| format!("Failed to read caption: {}", caption_path.display()))?;
            Ok(Some(clean_caption(&raw)))
        } else {
            Ok(Some(clean_caption(&self.default_caption)))
        }
    }

    /// Token shuffling and caption dropout.
    pub fn augment<R: Rng + ?Sized>(&self, caption: String, rng: &mut R) -> String {
        if self.caption_dropout_rate > 0.0 && rng.gen::<f32>() < self.caption_dropout_rate {
            return String::new();
        }
        if self.shuffle_tokens {
            let mut tokens: Vec<&str> = caption.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            tokens.shuffle(rng);
            return tokens.join(", ");
        }
        caption
    }

    pub fn resolve<R: Rng + ?Sized>(&self, image_path: &Path, rng: &mut R) -> Result<Option<String>> {
        Ok(self.read_caption(image_path)?.map(|c| self.augment(c, rng)))
    }
}

/// Adds the embedding placeholder and the trigger word to prompts.
#[derive(Debug, Clone, Default)]
pub struct PromptConditioner {
    pub trigger_word: Option<String>,
    pub add_if_not_present: bool,
}

impl PromptConditioner {
    pub fn new(trigger_word: Option<String>) -> Self {
        Self {
            trigger_word: trigger_word.filter(|w| !w.trim().is_empty()),
            add_if_not_present: true,
        }
    }

    /// Regularization prompts never receive the trigger word. The embedding
    /// placeholder goes in first, so a prepended trigger ends up in front of it.
    pub fn condition(&self, prompt: &str, is_reg: bool, embedding: Option<&Embedding>) -> String {
        let mut prompt = prompt.to_string();
        if let Some(embedding) = embedding {
            prompt = embedding.inject_embedding_to_prompt(&prompt, self.add_if_not_present);
        }
        if !is_reg {
            if let Some(trigger) = &self.trigger_word {
                prompt = inject_word(&prompt, trigger, self.add_if_not_present);
            }
        }
        prompt
    }
}
