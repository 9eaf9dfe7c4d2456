//! Image folder dataset with optional aspect-ratio bucketing

use anyhow::{Context, Result};
use candle_core::Device;
use image::DynamicImage;
use log::info;
use rand::Rng;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DatasetConfig;
use crate::data::buckets::{group_buckets, make_batches, Bucket, FileItem};
use crate::data::caption::CaptionResolver;
use crate::data::image_ops::{image_to_tensor, is_supported_image, load_rgb_image, read_image_size, resize};
use crate::data::{Batch, Sample};
use crate::error::{config_error, TrainerError};

/// Counts reported after a folder scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub found: usize,
    pub too_small: usize,
    pub unreadable: usize,
}

pub struct ImageDataset {
    config: DatasetConfig,
    file_list: Vec<FileItem>,
    buckets: Vec<Bucket>,
    batch_indices: Vec<Vec<usize>>,
    captions: CaptionResolver,
    stats: ScanStats,
}

fn list_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(folder)
        .with_context(|| format!("Failed to read dataset directory: {}", folder.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

impl ImageDataset {
    pub fn new(config: &DatasetConfig, batch_size: usize) -> Result<Self> {
        config.validate()?;
        let folder = &config.folder_path;
        info!("Loading dataset from {}", folder.display());

        let paths = list_images(folder)?;
        let sized: Vec<(PathBuf, Result<(u32, u32)>)> = paths
            .into_par_iter()
            .map(|path| {
                let size = read_image_size(&path);
                (path, size)
            })
            .collect();

        let mut stats = ScanStats::default();
        let mut file_list = Vec::new();
        for (path, size) in sized {
            match size {
                Ok((width, height)) => {
                    let item = FileItem::new(path, width, height, config.scale);
                    if item.min_scaled_side() < config.resolution {
                        stats.too_small += 1;
                    } else {
                        file_list.push(item);
                    }
                }
                Err(e) => {
                    log::debug!("Skipping unreadable image {}: {:#}", path.display(), e);
                    stats.unreadable += 1;
                }
            }
        }
        stats.found = file_list.len();

        info!("  -  Found {} images", stats.found);
        if stats.too_small > 0 {
            info!("  -  Skipped {} images that were smaller than the resolution", stats.too_small);
        }
        if stats.unreadable > 0 {
            info!("  -  Skipped {} images that could not be read", stats.unreadable);
        }
        if file_list.is_empty() {
            return config_error(format!("no images found in {}", folder.display()));
        }

        let mut dataset = Self {
            config: config.clone(),
            file_list,
            buckets: Vec::new(),
            batch_indices: Vec::new(),
            captions: CaptionResolver::from_config(config),
            stats,
        };

        if config.buckets {
            dataset.setup_buckets(batch_size);
        }
        Ok(dataset)
    }

    fn setup_buckets(&mut self, batch_size: usize) {
        let resolution = self.config.resolution;
        let tolerance = self.config.bucket_tolerance;
        self.file_list = self.file_list.iter().map(|item| item.with_bucket(resolution, tolerance)).collect();
        self.buckets = group_buckets(&self.file_list);
        self.batch_indices = make_batches(&self.buckets, batch_size, &mut rand::thread_rng());

        info!("Bucket sizes for {}:", self.config.folder_path.display());
        for bucket in &self.buckets {
            info!("{}x{}: {} files", bucket.width, bucket.height, bucket.file_indices.len());
        }
        info!("{} buckets made", self.buckets.len());
    }

    /// Batch count when bucketed, image count otherwise.
    pub fn len(&self) -> usize {
        if self.config.buckets {
            self.batch_indices.len()
        } else {
            self.file_list.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_bucketed(&self) -> bool {
        self.config.buckets
    }

    pub fn is_reg(&self) -> bool {
        self.config.is_reg
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn file_list(&self) -> &[FileItem] {
        &self.file_list
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn batch_indices(&self) -> &[Vec<usize>] {
        &self.batch_indices
    }

    fn maybe_flip<R: Rng + ?Sized>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        if self.config.random_flip && rng.gen_bool(0.5) {
            img.fliph()
        } else {
            img
        }
    }

    fn finish_sample<R: Rng + ?Sized>(&self, item: &FileItem, img: DynamicImage, rng: &mut R) -> Result<Sample> {
        let img = self.maybe_flip(img, rng);
        Ok(Sample {
            image: image_to_tensor(&img, &Device::Cpu)?,
            prompt: self.captions.resolve(&item.path, rng)?,
            is_reg: self.config.is_reg,
            path: item.path.clone(),
        })
    }

    /// One `[3, resolution, resolution]` sample from the non-bucketed path.
    pub fn get_sample<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let item = self
            .file_list
            .get(index)
            .with_context(|| format!("sample index {} out of range", index))?;
        let resolution = self.config.resolution;
        let mut img = load_rgb_image(&item.path)?;

        let scaled_w = ((img.width() as f32 * self.config.scale) as u32).max(1);
        let scaled_h = ((img.height() as f32 * self.config.scale) as u32).max(1);
        img = resize(&img, scaled_w, scaled_h);

        // decoded size can undershoot the header size by a pixel after scaling
        let min_side = img.width().min(img.height());
        if min_side < resolution {
            img = resize_short_side(&img, resolution);
        }

        let img = if self.config.uses_random_crop() {
            if self.config.random_scale {
                let min_side = img.width().min(img.height());
                if min_side > resolution {
                    let target = rng.gen_range(resolution..=min_side);
                    img = resize_short_side(&img, target);
                }
            }
            let x = rng.gen_range(0..=img.width() - resolution);
            let y = rng.gen_range(0..=img.height() - resolution);
            img.crop_imm(x, y, resolution, resolution)
        } else {
            let min_side = img.width().min(img.height());
            let x = (img.width() - min_side) / 2;
            let y = (img.height() - min_side) / 2;
            resize(&img.crop_imm(x, y, min_side, min_side), resolution, resolution)
        };

        self.finish_sample(item, img, rng)
    }

    /// Load one item at its bucket geometry.
    pub fn load_bucketed_item<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let item = self
            .file_list
            .get(index)
            .with_context(|| format!("file index {} out of range", index))?;
        let img = load_rgb_image(&item.path)?;
        let (width, height) = (img.width(), img.height());

        if (width > height && item.scale_to_width < item.scale_to_height)
            || (width < height && item.scale_to_width > item.scale_to_height)
        {
            return Err(TrainerError::GeometryMismatch {
                path: item.path.clone(),
                width,
                height,
                scale_to_width: item.scale_to_width,
                scale_to_height: item.scale_to_height,
            }
            .into());
        }

        let img = resize(&img, item.scale_to_width, item.scale_to_height).crop_imm(
            item.crop_x,
            item.crop_y,
            item.crop_width,
            item.crop_height,
        );
        self.finish_sample(item, img, rng)
    }

    /// Stack every item of bucket batch `batch_id`.
    pub fn get_batch<R: Rng + ?Sized>(&self, batch_id: usize, rng: &mut R) -> Result<Batch> {
        let indices = self
            .batch_indices
            .get(batch_id)
            .with_context(|| format!("batch index {} out of range", batch_id))?;
        let samples = indices
            .iter()
            .map(|&idx| self.load_bucketed_item(idx, rng))
            .collect::<Result<Vec<_>>>()?;
        Batch::collate(samples)
    }
}

/// Resize so the shorter side equals `target`, keeping the aspect ratio.
fn resize_short_side(img: &DynamicImage, target: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    let min_side = width.min(height).max(1) as f64;
    let factor = target as f64 / min_side;
    let new_w = ((width as f64 * factor).round() as u32).max(target);
    let new_h = ((height as f64 * factor).round() as u32).max(target);
    resize(img, new_w, new_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn write_image(dir: &Path, name: &str, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        img.save(dir.join(name)).unwrap();
    }

    fn config(dir: &Path) -> DatasetConfig {
        DatasetConfig {
            folder_path: dir.to_path_buf(),
            resolution: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_too_small_and_unreadable_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png", 64, 64);
        write_image(dir.path(), "b.png", 80, 100);
        write_image(dir.path(), "small.png", 32, 128);
        fs::write(dir.path().join("broken.jpg"), b"nope").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let dataset = ImageDataset::new(&config(dir.path()), 1).unwrap();
        assert_eq!(dataset.stats(), ScanStats { found: 2, too_small: 1, unreadable: 1 });
        assert_eq!(dataset.len(), 2);
        assert!(dataset
            .file_list()
            .iter()
            .all(|item| item.min_scaled_side() >= 64));
    }

    #[test]
    fn test_empty_folder_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "small.png", 16, 16);
        let err = ImageDataset::new(&config(dir.path()), 1).err().unwrap();
        assert!(matches!(err.downcast_ref::<TrainerError>(), Some(TrainerError::Configuration(_))));
        assert!(err.to_string().contains("no images found"));
    }

    #[test]
    fn test_scale_applies_before_size_filter() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png", 100, 100);
        let mut cfg = config(dir.path());
        cfg.scale = 0.5;
        assert!(ImageDataset::new(&cfg, 1).is_err());
        cfg.scale = 0.7;
        assert_eq!(ImageDataset::new(&cfg, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_non_bucketed_samples_are_square_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "wide.png", 150, 90);
        write_image(dir.path(), "tall.jpg", 70, 200);
        fs::write(dir.path().join("wide.txt"), "a wide image").unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        for random in [false, true] {
            let mut cfg = config(dir.path());
            cfg.random_scale = random;
            cfg.random_flip = random;
            let dataset = ImageDataset::new(&cfg, 1).unwrap();
            for index in 0..dataset.len() {
                let sample = dataset.get_sample(index, &mut rng).unwrap();
                assert_eq!(sample.image.dims(), &[3, 64, 64]);
                let values = sample.image.flatten_all().unwrap();
                let min = values.min(0).unwrap();
                let max = values.max(0).unwrap();
                assert!(min.to_scalar::<f32>().unwrap() >= -1.0);
                assert!(max.to_scalar::<f32>().unwrap() <= 1.0);
            }
        }

        let dataset = ImageDataset::new(&config(dir.path()), 1).unwrap();
        let tall = dataset.get_sample(0, &mut rng).unwrap();
        let wide = dataset.get_sample(1, &mut rng).unwrap();
        assert_eq!(tall.prompt.as_deref(), Some(""));
        assert_eq!(wide.prompt.as_deref(), Some("a wide image"));
    }

    #[test]
    fn test_bucketed_batches_have_one_shape() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write_image(dir.path(), &format!("sq{}.png", i), 64, 64);
            write_image(dir.path(), &format!("wide{}.png", i), 140, 64);
        }
        let mut cfg = config(dir.path());
        cfg.buckets = true;
        cfg.bucket_tolerance = 32;
        let dataset = ImageDataset::new(&cfg, 2).unwrap();
        assert_eq!(dataset.buckets().len(), 2);
        assert_eq!(dataset.len(), 4);

        let mut rng = StdRng::seed_from_u64(5);
        for batch_id in 0..dataset.len() {
            let batch = dataset.get_batch(batch_id, &mut rng).unwrap();
            let (_, c, h, w) = batch.images.dims4().unwrap();
            assert_eq!(c, 3);
            assert!((h, w) == (64, 64) || (h, w) == (64, 128));
        }
    }

    #[test]
    fn test_geometry_mismatch_is_raised() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "wide.png", 128, 64);
        let mut cfg = config(dir.path());
        cfg.buckets = true;
        let dataset = ImageDataset::new(&cfg, 1).unwrap();

        // image replaced by a tall one after the scan
        write_image(dir.path(), "wide.png", 64, 128);
        let err = dataset.load_bucketed_item(0, &mut rand::thread_rng()).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainerError>(), Some(TrainerError::GeometryMismatch { .. })));
    }
}
