//! Conversion of the refined tensor into an 8-bit image on disk.

use std::path::Path;

use image::{Rgb, RgbImage};
use ndarray::{Array4, Axis};

use crate::InpaintError;

/// Converts the first batch element (`3 x H x W`, `[0, 1]`) into an RGB image.
///
/// Values are scaled by 255, rounded and clipped to `[0, 255]`.
pub fn tensor_to_image(output: &Array4<f32>) -> Result<RgbImage, InpaintError> {
    let (batch, channels, height, width) = output.dim();
    if batch == 0 || channels != 3 {
        return Err(InpaintError::Inference(format!(
            "cannot convert tensor of shape {:?} to an RGB image",
            output.shape()
        )));
    }
    let (width_px, height_px) = (
        u32::try_from(width).map_err(|_| oversized(width, height))?,
        u32::try_from(height).map_err(|_| oversized(width, height))?,
    );
    let first = output.index_axis(Axis(0), 0);
    Ok(RgbImage::from_fn(width_px, height_px, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([0, 1, 2].map(|c| to_byte(first[[c, y, x]])))
    }))
}

fn oversized(width: usize, height: usize) -> InpaintError {
    InpaintError::Inference(format!("output {width}x{height} is too large"))
}

/// Rounds to the nearest byte instead of truncating, so values that came
/// from 8-bit pixels (`k / 255`) map back to `k` exactly.
fn to_byte(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Creates the parent directory of `path` when it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<(), InpaintError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|err| {
                InpaintError::Io(format!(
                    "failed to create output directory {}: {err}",
                    parent.display()
                ))
            }),
        _ => Ok(()),
    }
}

/// Encodes `image` according to the extension of `path`.
pub fn write_image(image: &RgbImage, path: &Path) -> Result<(), InpaintError> {
    ensure_parent_dir(path)?;
    image
        .save(path)
        .map_err(|err| InpaintError::Image(format!("failed to write {}: {err}", path.display())))
}
