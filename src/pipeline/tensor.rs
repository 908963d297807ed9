//! CHW tensor helpers shared by the dataset loader and the refiner.
//!
//! Images are `3 x H x W` and masks `1 x H x W`, both `f32` in `[0, 1]`.

use image::{GrayImage, RgbImage};
use ndarray::{Array3, ArrayView3};

/// Rounds `value` up to the next multiple of `modulo`.
pub fn ceil_modulo(value: usize, modulo: usize) -> usize {
    if modulo <= 1 || value % modulo == 0 {
        value
    } else {
        (value / modulo + 1) * modulo
    }
}

/// Mirror index including the edge sample (numpy `symmetric` mode).
fn symmetric_index(index: usize, len: usize) -> usize {
    let period = 2 * len;
    let folded = index % period;
    if folded < len {
        folded
    } else {
        period - 1 - folded
    }
}

/// Pads at the bottom and right with symmetric reflection up to `out_h x out_w`.
pub fn pad_symmetric(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, height, width) = src.dim();
    if height == 0 || width == 0 {
        return Array3::zeros((channels, out_h, out_w));
    }
    Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
        src[[c, symmetric_index(y, height), symmetric_index(x, width)]]
    })
}

/// Bilinear resize with half-pixel centers.
pub fn resize_bilinear(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, height, width) = src.dim();
    if (height, width) == (out_h, out_w) {
        return src.to_owned();
    }
    let ys: Vec<(usize, usize, f32)> = (0..out_h).map(|y| sample_axis(y, height, out_h)).collect();
    let xs: Vec<(usize, usize, f32)> = (0..out_w).map(|x| sample_axis(x, width, out_w)).collect();
    Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
        let (y0, y1, fy) = ys[y];
        let (x0, x1, fx) = xs[x];
        let top = src[[c, y0, x0]] * (1.0 - fx) + src[[c, y0, x1]] * fx;
        let bottom = src[[c, y1, x0]] * (1.0 - fx) + src[[c, y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

fn sample_axis(out: usize, in_len: usize, out_len: usize) -> (usize, usize, f32) {
    let scale = in_len as f32 / out_len as f32;
    let pos = ((out as f32 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f32);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(in_len - 1);
    (lo, hi, pos - lo as f32)
}

/// Resizes a binary mask so that any covered source pixel stays covered.
pub fn resize_mask(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, height, width) = src.dim();
    if (height, width) == (out_h, out_w) {
        return src.to_owned();
    }
    let rows: Vec<(usize, usize)> = (0..out_h).map(|y| cover_span(y, height, out_h)).collect();
    let cols: Vec<(usize, usize)> = (0..out_w).map(|x| cover_span(x, width, out_w)).collect();
    Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
        let (y0, y1) = rows[y];
        let (x0, x1) = cols[x];
        let covered = (y0..y1).any(|sy| (x0..x1).any(|sx| src[[c, sy, sx]] > 0.0));
        if covered { 1.0 } else { 0.0 }
    })
}

/// Source range `[start, end)` overlapped by output cell `out`.
fn cover_span(out: usize, in_len: usize, out_len: usize) -> (usize, usize) {
    let start = out * in_len / out_len;
    let end = ((out + 1) * in_len).div_ceil(out_len).max(start + 1);
    (start.min(in_len - 1), end.min(in_len))
}

/// Keeps `known` outside the mask and takes `predicted` inside it.
pub fn composite(
    known: ArrayView3<'_, f32>,
    predicted: ArrayView3<'_, f32>,
    mask: ArrayView3<'_, f32>,
) -> Array3<f32> {
    Array3::from_shape_fn(known.dim(), |(c, y, x)| {
        let weight = mask[[0, y, x]];
        known[[c, y, x]] * (1.0 - weight) + predicted[[c, y, x]] * weight
    })
}

/// Converts an RGB image to a `3 x H x W` tensor in `[0, 1]`.
pub fn rgb_to_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Converts a grayscale image to a `1 x H x W` tensor in `[0, 1]`.
pub fn luma_to_chw(image: &GrayImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((1, height as usize, width as usize), |(_, y, x)| {
        image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    })
}
