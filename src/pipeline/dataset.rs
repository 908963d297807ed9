//! Single-sample loader turning an image/mask pair into padded tensors.

use std::path::Path;

use image::{GrayImage, RgbImage, imageops::FilterType};
use ndarray::Array3;
use tracing::{debug, instrument};

use crate::{InpaintError, config::DatasetConfig};

use super::tensor::{ceil_modulo, luma_to_chw, pad_symmetric, rgb_to_chw};

/// One image/mask pair ready for collation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `3 x H x W` RGB in `[0, 1]`.
    pub image: Array3<f32>,
    /// `1 x H x W` in `[0, 1]`.
    pub mask: Array3<f32>,
    /// Height and width before padding, recorded only when padding is configured.
    pub unpad_to_size: Option<(usize, usize)>,
}

impl Sample {
    pub fn new(image: Array3<f32>, mask: Array3<f32>) -> Result<Self, InpaintError> {
        let (_, image_h, image_w) = image.dim();
        let (_, mask_h, mask_w) = mask.dim();
        if image.dim().0 != 3 || mask.dim().0 != 1 {
            return Err(InpaintError::Dataset(format!(
                "expected 3-channel image and 1-channel mask, got {} and {}",
                image.dim().0,
                mask.dim().0
            )));
        }
        if (image_h, image_w) != (mask_h, mask_w) {
            return Err(InpaintError::Dataset(format!(
                "mask {mask_w}x{mask_h} does not match image {image_w}x{image_h}"
            )));
        }
        Ok(Self {
            image,
            mask,
            unpad_to_size: None,
        })
    }

    pub fn size(&self) -> (usize, usize) {
        let (_, height, width) = self.image.dim();
        (height, width)
    }

    /// Pads image and mask up to a multiple of `modulo` and records the original size.
    pub fn pad_to_modulo(self, modulo: usize) -> Self {
        let (height, width) = self.size();
        let (out_h, out_w) = (ceil_modulo(height, modulo), ceil_modulo(width, modulo));
        Self {
            image: pad_symmetric(self.image.view(), out_h, out_w),
            mask: pad_symmetric(self.mask.view(), out_h, out_w),
            unpad_to_size: Some((height, width)),
        }
    }
}

/// Loads and prepares the sample for `image_path` and `mask_path`.
#[instrument(skip_all, fields(image = %image_path.display(), mask = %mask_path.display()))]
pub fn load_sample(
    image_path: &Path,
    mask_path: &Path,
    config: &DatasetConfig,
) -> Result<Sample, InpaintError> {
    let image = open_image(image_path)?.to_rgb8();
    let mask = open_image(mask_path)?.to_luma8();
    let (image, mask) = match config.scale_factor {
        Some(factor) => scale_pair(image, mask, factor),
        None => (image, mask),
    };

    let sample = Sample::new(rgb_to_chw(&image), luma_to_chw(&mask))?;
    let sample = match config.pad_out_to_modulo {
        Some(modulo) if modulo > 1 => sample.pad_to_modulo(modulo),
        _ => sample,
    };
    debug!(size = ?sample.size(), unpad_to_size = ?sample.unpad_to_size, "sample loaded");
    Ok(sample)
}

fn open_image(path: &Path) -> Result<image::DynamicImage, InpaintError> {
    image::open(path)
        .map_err(|err| InpaintError::Image(format!("failed to read {}: {err}", path.display())))
}

fn scale_pair(image: RgbImage, mask: GrayImage, factor: f32) -> (RgbImage, GrayImage) {
    let (width, height) = image.dimensions();
    let out_w = ((width as f32 * factor).round() as u32).max(1);
    let out_h = ((height as f32 * factor).round() as u32).max(1);
    let (mask_w, mask_h) = mask.dimensions();
    let mask_out_w = ((mask_w as f32 * factor).round() as u32).max(1);
    let mask_out_h = ((mask_h as f32 * factor).round() as u32).max(1);
    (
        image::imageops::resize(&image, out_w, out_h, FilterType::Triangle),
        image::imageops::resize(&mask, mask_out_w, mask_out_h, FilterType::Nearest),
    )
}
