//! Aspect-ratio buckets
//!
//! Every image is scaled so its short side equals the training resolution;
//! the long side is cropped down to a multiple of the bucket tolerance.
//! Images sharing the resulting crop size form a bucket, and buckets are
//! cut into batches so every batch has a single tensor shape.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One image of a dataset, with the geometry it is loaded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    pub path: PathBuf,
    /// Displayed size on disk
    pub width: u32,
    pub height: u32,
    /// Size the image is resized to before cropping
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
}

impl FileItem {
    pub fn new(path: PathBuf, width: u32, height: u32, scale: f32) -> Self {
        let scale_to_width = (width as f32 * scale) as u32;
        let scale_to_height = (height as f32 * scale) as u32;
        Self {
            path,
            width,
            height,
            scale_to_width,
            scale_to_height,
            crop_x: 0,
            crop_y: 0,
            crop_width: scale_to_width,
            crop_height: scale_to_height,
        }
    }

    pub fn min_scaled_side(&self) -> u32 {
        self.scale_to_width.min(self.scale_to_height)
    }

    /// Copy of this item with bucket geometry filled in.
    pub fn with_bucket(&self, resolution: u32, bucket_tolerance: u32) -> Self {
        let geometry = bucket_geometry(self.scale_to_width, self.scale_to_height, resolution, bucket_tolerance);
        Self {
            scale_to_width: geometry.scale_to_width,
            scale_to_height: geometry.scale_to_height,
            crop_x: geometry.crop_x,
            crop_y: geometry.crop_y,
            crop_width: geometry.crop_width,
            crop_height: geometry.crop_height,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGeometry {
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
}

fn snap_long_side(long: u32, resolution: u32, tolerance: u32) -> u32 {
    let snapped = (long / tolerance) * tolerance;
    snapped.max(resolution).min(long)
}

/// Short side to exactly `resolution`, long side scaled to match and its
/// crop snapped down to a multiple of `tolerance`, crop centred.
pub fn bucket_geometry(width: u32, height: u32, resolution: u32, tolerance: u32) -> BucketGeometry {
    let tolerance = tolerance.max(1);
    let min_side = width.min(height).max(1);
    let factor = resolution as f64 / min_side as f64;

    let (scale_to_width, scale_to_height) = if width <= height {
        (resolution, ((height as f64 * factor).round() as u32).max(resolution))
    } else {
        (((width as f64 * factor).round() as u32).max(resolution), resolution)
    };

    let (crop_width, crop_height) = if width <= height {
        (resolution, snap_long_side(scale_to_height, resolution, tolerance))
    } else {
        (snap_long_side(scale_to_width, resolution, tolerance), resolution)
    };

    BucketGeometry {
        scale_to_width,
        scale_to_height,
        crop_x: (scale_to_width - crop_width) / 2,
        crop_y: (scale_to_height - crop_height) / 2,
        crop_width,
        crop_height,
    }
}

/// Items with the same crop size, by index into the dataset's file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub width: u32,
    pub height: u32,
    pub file_indices: Vec<usize>,
}

/// Group items by crop size, smallest sizes first.
pub fn group_buckets(items: &[FileItem]) -> Vec<Bucket> {
    let mut map: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
    for (idx, item) in items.iter().enumerate() {
        map.entry((item.crop_width, item.crop_height)).or_default().push(idx);
    }
    map.into_iter()
        .map(|((width, height), file_indices)| Bucket { width, height, file_indices })
        .collect()
}

/// Shuffle inside each bucket and slice it into batches. A trailing batch
/// smaller than `batch_size` is kept.
pub fn make_batches<R: Rng + ?Sized>(buckets: &[Bucket], batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    for bucket in buckets {
        let mut indices = bucket.file_indices.clone();
        indices.shuffle(rng);
        batches.extend(indices.chunks(batch_size).map(|c| c.to_vec()));
    }
    batches
}
