//! Collation of a single sample into a model batch.

use ndarray::{Array4, Axis};

use crate::InpaintError;

use super::dataset::Sample;

/// Batch of one sample with a leading batch dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `1 x 3 x H x W`.
    pub image: Array4<f32>,
    /// `1 x 1 x H x W`, binary.
    pub mask: Array4<f32>,
    pub unpad_to_size: Option<(usize, usize)>,
}

impl Batch {
    pub fn image_shape(&self) -> [usize; 4] {
        let (n, c, h, w) = self.image.dim();
        [n, c, h, w]
    }

    /// Returns the unpadded size the refiner crops to.
    pub fn require_unpad_size(&self) -> Result<(usize, usize), InpaintError> {
        let (height, width) = self.unpad_to_size.ok_or(InpaintError::MissingUnpadSize)?;
        let [_, _, padded_h, padded_w] = self.image_shape();
        if height == 0 || width == 0 || height > padded_h || width > padded_w {
            return Err(InpaintError::Dataset(format!(
                "unpad size {height}x{width} does not fit batch {padded_h}x{padded_w}"
            )));
        }
        Ok((height, width))
    }
}

/// Adds the batch dimension and binarizes the mask (`> 0` becomes 1).
pub fn collate(sample: Sample) -> Batch {
    Batch {
        image: sample.image.insert_axis(Axis(0)),
        mask: sample
            .mask
            .mapv(|value| if value > 0.0 { 1.0 } else { 0.0 })
            .insert_axis(Axis(0)),
        unpad_to_size: sample.unpad_to_size,
    }
}
