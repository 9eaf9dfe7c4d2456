//! Dataset scanning, bucketing, captions and batch loading

pub mod buckets;
pub mod caption;
pub mod dataset;
pub mod image_ops;
pub mod loader;

pub use buckets::{Bucket, FileItem};
pub use caption::{CaptionResolver, PromptConditioner};
pub use dataset::{ImageDataset, ScanStats};
pub use loader::{BatchStream, DataLoader};

use anyhow::{Context, Result};
use candle_core::Tensor;
use std::path::PathBuf;

/// One loaded image, `[3, H, W]` in `[-1, 1]` on the CPU.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Tensor,
    pub prompt: Option<String>,
    pub is_reg: bool,
    pub path: PathBuf,
}

/// Stacked samples of identical shape.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, H, W]`
    pub images: Tensor,
    /// Present when every sample in the batch has a caption
    pub prompts: Option<Vec<String>>,
    pub is_reg: Vec<bool>,
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("cannot collate an empty batch");
        }
        let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
        let images = Tensor::stack(&images, 0).with_context(|| {
            let shapes: Vec<_> = samples.iter().map(|s| s.image.dims().to_vec()).collect();
            format!("batch samples differ in shape: {:?}", shapes)
        })?;

        let prompts = samples.iter().map(|s| s.prompt.clone()).collect::<Option<Vec<_>>>();
        Ok(Self {
            images,
            prompts,
            is_reg: samples.iter().map(|s| s.is_reg).collect(),
            paths: samples.into_iter().map(|s| s.path).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.is_reg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_reg.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample(h: usize, prompt: Option<&str>) -> Sample {
        Sample {
            image: Tensor::zeros((3, h, 8), DType::F32, &Device::Cpu).unwrap(),
            prompt: prompt.map(String::from),
            is_reg: false,
            path: PathBuf::from("x.png"),
        }
    }

    #[test]
    fn test_collate_stacks_and_keeps_prompts() {
        let batch = Batch::collate(vec![sample(4, Some("a")), sample(4, Some("b"))]).unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 4, 8]);
        assert_eq!(batch.prompts, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_collate_without_captions() {
        let batch = Batch::collate(vec![sample(4, Some("a")), sample(4, None)]).unwrap();
        assert!(batch.prompts.is_none());
    }

    #[test]
    fn test_collate_rejects_mixed_shapes() {
        assert!(Batch::collate(vec![sample(4, None), sample(6, None)]).is_err());
        assert!(Batch::collate(Vec::new()).is_err());
    }
}
