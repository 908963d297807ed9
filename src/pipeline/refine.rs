//! Multi-scale refinement over an [`InpaintModel`].
//!
//! The unpadded image is optionally shrunk to fit the pixel budget, then
//! processed coarse to fine over an image/mask pyramid. The coarsest level
//! sets the global structure; every finer level keeps the fine detail of its
//! own prediction and takes the low frequencies from the level below.

use ndarray::{Array3, Array4, ArrayView3, Axis, s};
use tracing::{debug, instrument};

use crate::{InpaintError, config::RefinerConfig};

use super::{
    Interrupter,
    batch::Batch,
    model::InpaintModel,
    tensor::{ceil_modulo, composite, pad_symmetric, resize_bilinear, resize_mask},
};

/// One pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub image: Array3<f32>,
    pub mask: Array3<f32>,
}

impl Level {
    fn size(&self) -> (usize, usize) {
        let (_, height, width) = self.image.dim();
        (height, width)
    }
}

/// Number of pyramid levels for an image of `height x width`.
pub fn scale_count(height: usize, width: usize, config: &RefinerConfig) -> usize {
    let ratio = height.min(width) as f64 / config.min_side.max(1) as f64;
    let extra = ratio.log2().max(0.0).round() as usize;
    (1 + extra).min(config.max_scales.max(1))
}

/// Working size keeping `height * width` within `px_budget`.
pub fn budget_size(height: usize, width: usize, px_budget: usize) -> (usize, usize) {
    let pixels = height * width;
    if pixels <= px_budget {
        return (height, width);
    }
    let ratio = (px_budget as f64 / pixels as f64).sqrt();
    (
        ((height as f64 * ratio).floor() as usize).max(1),
        ((width as f64 * ratio).floor() as usize).max(1),
    )
}

/// Builds the pyramid from finest (index 0) to coarsest.
pub fn build_pyramid(image: Array3<f32>, mask: Array3<f32>, config: &RefinerConfig) -> Vec<Level> {
    let (_, height, width) = image.dim();
    let count = scale_count(height, width, config);
    let mut levels = vec![Level { image, mask }];
    for _ in 1..count {
        let Some(coarsest) = levels.last() else { break };
        let (h, w) = coarsest.size();
        let (out_h, out_w) = ((h / 2).max(1), (w / 2).max(1));
        let next = Level {
            image: resize_bilinear(coarsest.image.view(), out_h, out_w),
            mask: resize_mask(coarsest.mask.view(), out_h, out_w),
        };
        levels.push(next);
    }
    levels
}

/// Runs the refinement pass, returning `1 x 3 x H x W` at the unpadded size.
///
/// `interrupter` is checked before every model pass.
#[instrument(skip_all, fields(shape = ?batch.image_shape()))]
pub fn refine_predict<M: InpaintModel>(
    batch: &Batch,
    model: &mut M,
    config: &RefinerConfig,
    interrupter: &Interrupter,
) -> Result<Array4<f32>, InpaintError> {
    let (height, width) = batch.require_unpad_size()?;
    let image = batch.image.index_axis(Axis(0), 0);
    let image = image.slice(s![.., ..height, ..width]);
    let mask = batch.mask.index_axis(Axis(0), 0);
    let mask = mask.slice(s![.., ..height, ..width]);

    let (work_h, work_w) = budget_size(height, width, config.px_budget);
    let (work_image, work_mask) = if (work_h, work_w) == (height, width) {
        (image.to_owned(), mask.to_owned())
    } else {
        debug!(work_h, work_w, "downscaling to fit pixel budget");
        (
            resize_bilinear(image, work_h, work_w),
            resize_mask(mask, work_h, work_w),
        )
    };

    let levels = build_pyramid(work_image, work_mask, config);
    let mut prediction: Option<Array3<f32>> = None;
    for (index, level) in levels.iter().enumerate().rev() {
        interrupter.check()?;
        let (level_h, level_w) = level.size();
        let fine = run_pass(model, level.image.view(), level.mask.view(), config.modulo)?;
        let merged = match prediction.take() {
            None => fine,
            Some(coarse) => {
                let (coarse_h, coarse_w) = (coarse.dim().1, coarse.dim().2);
                let coarse_up = resize_bilinear(coarse.view(), level_h, level_w);
                let fine_low = resize_bilinear(
                    resize_bilinear(fine.view(), coarse_h, coarse_w).view(),
                    level_h,
                    level_w,
                );
                let detailed = (&coarse_up + &fine - &fine_low).mapv(|v| v.clamp(0.0, 1.0));
                composite(level.image.view(), detailed.view(), level.mask.view())
            }
        };
        debug!(level = index, height = level_h, width = level_w, "pyramid level refined");
        prediction = Some(merged);
    }
    let prediction = prediction.ok_or_else(|| {
        InpaintError::Inference("refinement produced no pyramid levels".to_string())
    })?;

    let output = if (work_h, work_w) == (height, width) {
        prediction
    } else {
        let upscaled = resize_bilinear(prediction.view(), height, width);
        composite(image, upscaled.view(), mask)
    };
    Ok(output.insert_axis(Axis(0)))
}

/// Single model pass at the level's resolution, composited with known pixels.
fn run_pass<M: InpaintModel>(
    model: &mut M,
    image: ArrayView3<'_, f32>,
    mask: ArrayView3<'_, f32>,
    modulo: usize,
) -> Result<Array3<f32>, InpaintError> {
    let (_, height, width) = image.dim();
    let fixed = model.fixed_input_size();
    let (model_image, model_mask) = match fixed {
        Some((fixed_h, fixed_w)) => (
            resize_bilinear(image, fixed_h, fixed_w),
            resize_mask(mask, fixed_h, fixed_w),
        ),
        None => {
            let (pad_h, pad_w) = (ceil_modulo(height, modulo), ceil_modulo(width, modulo));
            (
                pad_symmetric(image, pad_h, pad_w),
                pad_symmetric(mask, pad_h, pad_w),
            )
        }
    };
    let (_, in_h, in_w) = model_image.dim();

    let output = model.predict(
        model_image.insert_axis(Axis(0)).view(),
        model_mask.insert_axis(Axis(0)).view(),
    )?;
    let (_, _, out_h, out_w) = output.dim();
    if (out_h, out_w) != (in_h, in_w) {
        return Err(InpaintError::Inference(format!(
            "model returned {out_h}x{out_w} for a {in_h}x{in_w} input"
        )));
    }
    let predicted = output.index_axis_move(Axis(0), 0);
    let predicted = match fixed {
        Some(_) => resize_bilinear(predicted.view(), height, width),
        None => predicted.slice_move(s![.., ..height, ..width]),
    };
    Ok(composite(image, predicted.view(), mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayView4;

    /// Fills every pixel with a constant gray and records the input sizes.
    struct GrayModel {
        fixed: Option<(usize, usize)>,
        seen: Vec<(usize, usize)>,
    }

    impl InpaintModel for GrayModel {
        fn predict(
            &mut self,
            image: ArrayView4<'_, f32>,
            _mask: ArrayView4<'_, f32>,
        ) -> Result<Array4<f32>, InpaintError> {
            let (n, _, h, w) = image.dim();
            self.seen.push((h, w));
            Ok(Array4::from_elem((n, 3, h, w), 0.5))
        }

        fn fixed_input_size(&self) -> Option<(usize, usize)> {
            self.fixed
        }
    }

    fn batch(height: usize, width: usize, padded: (usize, usize)) -> Batch {
        let image = Array4::from_elem((1, 3, padded.0, padded.1), 0.2f32);
        let mut mask = Array4::zeros((1, 1, padded.0, padded.1));
        mask.slice_mut(s![.., .., height / 4..height / 2, width / 4..width / 2])
            .fill(1.0);
        Batch {
            image,
            mask,
            unpad_to_size: Some((height, width)),
        }
    }

    #[test]
    fn scale_count_follows_min_side() {
        let config = RefinerConfig {
            min_side: 512,
            max_scales: 3,
            ..RefinerConfig::default()
        };
        assert_eq!(scale_count(300, 400, &config), 1);
        assert_eq!(scale_count(1024, 1500, &config), 2);
        assert_eq!(scale_count(4096, 4096, &config), 3);
    }

    #[test]
    fn budget_keeps_small_images() {
        assert_eq!(budget_size(100, 100, 10_000), (100, 100));
        let (h, w) = budget_size(400, 100, 10_000);
        assert!(h * w <= 10_000);
        assert_eq!((h, w), (200, 50));
    }

    #[test]
    fn pyramid_halves_each_level() {
        let config = RefinerConfig {
            min_side: 8,
            max_scales: 3,
            ..RefinerConfig::default()
        };
        let levels = build_pyramid(
            Array3::zeros((3, 40, 33)),
            Array3::zeros((1, 40, 33)),
            &config,
        );
        let sizes: Vec<_> = levels.iter().map(Level::size).collect();
        assert_eq!(sizes, vec![(40, 33), (20, 16), (10, 8)]);
    }

    #[test]
    fn refinement_crops_and_keeps_known_pixels() {
        let batch = batch(10, 12, (16, 16));
        let mut model = GrayModel {
            fixed: None,
            seen: Vec::new(),
        };
        let output = refine_predict(
            &batch,
            &mut model,
            &RefinerConfig::default(),
            &Interrupter::new(),
        )
        .expect("refine");
        assert_eq!(output.dim(), (1, 3, 10, 12));
        assert_eq!(model.seen, vec![(16, 16)]);
        assert!((output[[0, 0, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((output[[0, 1, 3, 4]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn multi_scale_runs_coarse_to_fine() {
        let batch = batch(32, 32, (32, 32));
        let mut model = GrayModel {
            fixed: None,
            seen: Vec::new(),
        };
        let config = RefinerConfig {
            min_side: 8,
            max_scales: 3,
            modulo: 8,
            ..RefinerConfig::default()
        };
        let output = refine_predict(&batch, &mut model, &config, &Interrupter::new())
            .expect("refine");
        assert_eq!(model.seen, vec![(8, 8), (16, 16), (32, 32)]);
        assert!((output[[0, 2, 12, 12]] - 0.5).abs() < 1e-5);
        assert!((output[[0, 2, 31, 31]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn fixed_size_models_are_resized() {
        let batch = batch(12, 20, (16, 24));
        let mut model = GrayModel {
            fixed: Some((8, 8)),
            seen: Vec::new(),
        };
        let output = refine_predict(
            &batch,
            &mut model,
            &RefinerConfig::default(),
            &Interrupter::new(),
        )
        .expect("refine");
        assert_eq!(model.seen, vec![(8, 8)]);
        assert_eq!(output.dim(), (1, 3, 12, 20));
    }

    #[test]
    fn pixel_budget_scales_back_to_input_size() {
        let batch = batch(40, 40, (40, 40));
        let mut model = GrayModel {
            fixed: None,
            seen: Vec::new(),
        };
        let config = RefinerConfig {
            px_budget: 400,
            modulo: 1,
            ..RefinerConfig::default()
        };
        let output = refine_predict(&batch, &mut model, &config, &Interrupter::new())
            .expect("refine");
        assert_eq!(model.seen, vec![(20, 20)]);
        assert_eq!(output.dim(), (1, 3, 40, 40));
        assert!((output[[0, 0, 39, 39]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn missing_unpad_size_never_reaches_the_model() {
        let mut batch = batch(8, 8, (8, 8));
        batch.unpad_to_size = None;
        let mut model = GrayModel {
            fixed: None,
            seen: Vec::new(),
        };
        let err = refine_predict(
            &batch,
            &mut model,
            &RefinerConfig::default(),
            &Interrupter::new(),
        )
        .expect_err("missing size");
        assert_eq!(err, InpaintError::MissingUnpadSize);
        assert!(model.seen.is_empty());
    }

    /// Asks the job to stop after its first pass.
    struct StoppingModel {
        interrupter: Interrupter,
        passes: usize,
    }

    impl InpaintModel for StoppingModel {
        fn predict(
            &mut self,
            image: ArrayView4<'_, f32>,
            _mask: ArrayView4<'_, f32>,
        ) -> Result<Array4<f32>, InpaintError> {
            self.passes += 1;
            self.interrupter.stop();
            let (n, _, h, w) = image.dim();
            Ok(Array4::from_elem((n, 3, h, w), 0.5))
        }
    }

    #[test]
    fn interruption_stops_between_levels() {
        let batch = batch(32, 32, (32, 32));
        let interrupter = Interrupter::new();
        let mut model = StoppingModel {
            interrupter: interrupter.clone(),
            passes: 0,
        };
        let config = RefinerConfig {
            min_side: 8,
            max_scales: 3,
            ..RefinerConfig::default()
        };
        let err = refine_predict(&batch, &mut model, &config, &interrupter)
            .expect_err("interrupted");
        assert_eq!(err, InpaintError::Interrupted);
        assert_eq!(model.passes, 1);
    }

    #[test]
    fn stopped_job_never_reaches_the_model() {
        let batch = batch(16, 16, (16, 16));
        let interrupter = Interrupter::new();
        interrupter.stop();
        let mut model = GrayModel {
            fixed: None,
            seen: Vec::new(),
        };
        let err = refine_predict(&batch, &mut model, &RefinerConfig::default(), &interrupter)
            .expect_err("stopped");
        assert_eq!(err, InpaintError::Interrupted);
        assert!(model.seen.is_empty());
    }
}
