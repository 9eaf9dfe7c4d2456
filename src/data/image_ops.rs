//! Image probing, decoding and tensor conversion

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use std::path::Path;

use crate::logging::warn_once;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

pub const SLOW_READ_WARNING: &str = "Some images in the dataset cannot be fast read. \
     This may increase loading time. Consider converting them to PNG or JPEG.";

pub fn is_supported_image(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90 | Orientation::Rotate270 | Orientation::Rotate90FlipH | Orientation::Rotate270FlipH
    )
}

/// Displayed `(width, height)` of an image, EXIF orientation applied.
///
/// PNG and JPEG are answered from the header alone; anything else is fully
/// decoded.
pub fn read_image_size(path: &Path) -> Result<(u32, u32)> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to detect image format: {}", path.display()))?;

    match reader.format() {
        Some(ImageFormat::Png) | Some(ImageFormat::Jpeg) => {
            let mut decoder = reader
                .into_decoder()
                .with_context(|| format!("Failed to read image header: {}", path.display()))?;
            let (width, height) = decoder.dimensions();
            let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
            if swaps_axes(orientation) {
                Ok((height, width))
            } else {
                Ok((width, height))
            }
        }
        _ => {
            warn_once(SLOW_READ_WARNING);
            let img = load_rgb_image(path)?;
            Ok((img.width(), img.height()))
        }
    }
}

/// Decode, apply EXIF orientation and convert to 8-bit RGB.
pub fn load_rgb_image(path: &Path) -> Result<DynamicImage> {
    let mut decoder = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to detect image format: {}", path.display()))?
        .into_decoder()
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    img.apply_orientation(orientation);
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

pub fn resize(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// `[3, H, W]` float tensor in `[-1, 1]`.
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb: RgbImage = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .clamp(-1f32, 1f32)?;
    Ok(tensor)
}

/// Inverse of [`image_to_tensor`]: `[3, H, W]` in `[-1, 1]` to an RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        anyhow::bail!("expected a 3-channel image tensor, got {} channels", channels);
    }
    let pixels = tensor
        .to_dtype(DType::F32)?
        .clamp(-1.0f32, 1.0f32)?
        .affine(127.5, 127.5)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .context("tensor size does not match image dimensions")
}

pub fn save_image(tensor: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tensor_to_image(tensor)?
        .save(path)
        .with_context(|| format!("Failed to save image: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("a/b.JPG")));
        assert!(is_supported_image(Path::new("b.webp")));
        assert!(!is_supported_image(Path::new("b.txt")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    #[test]
    fn test_header_size_matches_decoded_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbImage::from_pixel(96, 40, Rgb([10, 20, 30])).save(&path).unwrap();
        assert_eq!(read_image_size(&path).unwrap(), (96, 40));

        let jpg = dir.path().join("tall.jpg");
        RgbImage::from_pixel(24, 56, Rgb([200, 100, 0])).save(&jpg).unwrap();
        assert_eq!(read_image_size(&jpg).unwrap(), (24, 56));
    }

    /// JPEG bytes carrying an EXIF APP1 segment with the given orientation tag.
    fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let mut encoded = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([120, 60, 30])))
            .write_to(&mut std::io::Cursor::new(&mut encoded), ImageFormat::Jpeg)
            .unwrap();

        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(b"II*\0");
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0x0112u16.to_le_bytes());
        payload.extend_from_slice(&3u16.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&orientation.to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&0u32.to_le_bytes());

        let mut bytes = encoded[..2].to_vec();
        bytes.extend_from_slice(&[0xFF, 0xE1]);
        bytes.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&encoded[2..]);
        bytes
    }

    #[test]
    fn test_exif_rotation_swaps_axes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.jpg");
        std::fs::write(&path, jpeg_with_orientation(80, 40, 6)).unwrap();

        assert_eq!(read_image_size(&path).unwrap(), (40, 80));
        let img = load_rgb_image(&path).unwrap();
        assert_eq!((img.width(), img.height()), (40, 80));

        let upright = dir.path().join("upright.jpg");
        std::fs::write(&upright, jpeg_with_orientation(80, 40, 1)).unwrap();
        assert_eq!(read_image_size(&upright).unwrap(), (80, 40));
    }

    #[test]
    fn test_webp_falls_back_to_full_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.webp");
        RgbImage::from_pixel(48, 32, Rgb([0, 128, 255])).save(&path).unwrap();
        assert!(is_supported_image(&path));

        assert_eq!(read_image_size(&path).unwrap(), (48, 32));
        // already reported by the fallback path
        assert!(!warn_once(SLOW_READ_WARNING));
    }

    #[test]
    fn test_unreadable_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(read_image_size(&path).is_err());
    }

    #[test]
    fn test_tensor_range_and_round_trip() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(3, 1, Rgb([255, 255, 255]));
        let tensor = image_to_tensor(&DynamicImage::ImageRgb8(img.clone()), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 2, 4]);

        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(values[0], -1.0);

        let back = tensor_to_image(&tensor).unwrap();
        assert_eq!(back.get_pixel(3, 1), &Rgb([255, 255, 255]));
        assert_eq!(back.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }
}
