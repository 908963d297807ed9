//! Inpainting model seam and its ONNX Runtime implementation.

use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayView4};
use ort::{
    execution_providers::ExecutionProviderDispatch,
    logging::LogLevel,
    session::Session,
    value::{TensorRef, ValueType},
};
use tracing::{debug, info, instrument};

use crate::{
    InpaintError,
    config::{Device, ModelConfig, OutputRange, TrainConfig},
};

/// A model filling masked regions of an image batch.
pub trait InpaintModel {
    /// `image` is `N x 3 x H x W` RGB in `[0, 1]`, `mask` is `N x 1 x H x W`
    /// with 1 marking pixels to fill. Returns `N x 3 x H' x W'` RGB in `[0, 1]`.
    fn predict(
        &mut self,
        image: ArrayView4<'_, f32>,
        mask: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, InpaintError>;

    /// Spatial size the model requires, if its graph fixes one.
    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        None
    }
}

/// Builds models from a checkpoint in the model directory.
pub trait ModelLoader: Send + 'static {
    type Model: InpaintModel;

    fn load(
        &self,
        train: &TrainConfig,
        checkpoint: &Path,
        model: &ModelConfig,
        device: Device,
    ) -> Result<Self::Model, InpaintError>;
}

/// Loader producing [`OrtInpainter`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtModelLoader;

impl ModelLoader for OrtModelLoader {
    type Model = OrtInpainter;

    fn load(
        &self,
        train: &TrainConfig,
        checkpoint: &Path,
        model: &ModelConfig,
        device: Device,
    ) -> Result<Self::Model, InpaintError> {
        debug!(
            training_model = ?train.training_model.kind,
            generator = ?train.generator.kind,
            predict_only = train.training_model.predict_only,
            "training config resolved"
        );
        OrtInpainter::from_file(checkpoint, model, device)
    }
}

/// LaMa-style generator exported to ONNX, fed a masked image and its mask.
pub struct OrtInpainter {
    session: Session,
    image_input: String,
    mask_input: String,
    output: String,
    output_range: OutputRange,
    fixed_size: Option<(usize, usize)>,
    model_path: PathBuf,
}

impl std::fmt::Debug for OrtInpainter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtInpainter")
            .field("image_input", &self.image_input)
            .field("mask_input", &self.mask_input)
            .field("output", &self.output)
            .field("output_range", &self.output_range)
            .field("fixed_size", &self.fixed_size)
            .field("model_path", &self.model_path)
            .finish()
    }
}

impl OrtInpainter {
    /// Opens an ONNX checkpoint on the given device.
    #[instrument(skip_all, fields(path = %path.display(), device = %device))]
    pub fn from_file(
        path: &Path,
        config: &ModelConfig,
        device: Device,
    ) -> Result<Self, InpaintError> {
        let load_error = |err: ort::Error| {
            InpaintError::Model(format!(
                "failed to create ONNX session for {}: {err}",
                path.display()
            ))
        };
        let providers = execution_providers(device)?;
        let mut builder = Session::builder()
            .map_err(load_error)?
            .with_log_level(LogLevel::Error)
            .map_err(load_error)?;
        if let Some(threads) = config.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(load_error)?;
        }
        let session = builder
            .with_execution_providers(providers)
            .map_err(load_error)?
            .commit_from_file(path)
            .map_err(load_error)?;

        let fixed_size = session
            .inputs
            .iter()
            .find(|input| input.name == config.image_input)
            .and_then(|input| match &input.input_type {
                ValueType::Tensor { shape, .. } => spatial_size(shape),
                _ => None,
            });
        if let Some((height, width)) = fixed_size {
            info!(height, width, "model declares a fixed input size");
        }

        Ok(Self {
            session,
            image_input: config.image_input.clone(),
            mask_input: config.mask_input.clone(),
            output: config.output.clone(),
            output_range: config.output_range,
            fixed_size,
            model_path: path.to_path_buf(),
        })
    }
}

/// Zeroes the pixels to fill: `image * (1 - mask)`, in standard layout.
fn mask_image(image: ArrayView4<'_, f32>, mask: ArrayView4<'_, f32>) -> Array4<f32> {
    let keep = mask.mapv(|value| 1.0 - value);
    (&image * &keep).as_standard_layout().into_owned()
}

/// Wraps raw output data as `N x 3 x H x W` in `[0, 1]`.
fn output_to_unit(
    dims: &[i64],
    data: &[f32],
    range: OutputRange,
) -> Result<Array4<f32>, InpaintError> {
    let (n, h, w) = match dims {
        [n, 3, h, w] if *n > 0 && *h > 0 && *w > 0 => {
            (*n as usize, *h as usize, *w as usize)
        }
        _ => {
            return Err(InpaintError::Inference(format!(
                "expected N x 3 x H x W output, got {dims:?}"
            )));
        }
    };
    let output = ArrayView4::from_shape((n, 3, h, w), data)
        .map_err(|err| InpaintError::Inference(format!("output shape mismatch: {err}")))?
        .to_owned();
    Ok(match range {
        OutputRange::Unit => output,
        OutputRange::Byte => output.mapv(|value| value / 255.0),
    })
}

/// Reads `[N, C, H, W]` and returns `H, W` when both are static.
fn spatial_size(shape: &[i64]) -> Option<(usize, usize)> {
    match shape {
        [_, _, height, width] if *height > 0 && *width > 0 => {
            Some((*height as usize, *width as usize))
        }
        _ => None,
    }
}

fn execution_providers(device: Device) -> Result<Vec<ExecutionProviderDispatch>, InpaintError> {
    match device {
        Device::Cpu => Ok(vec![
            ort::execution_providers::CPUExecutionProvider::default().build(),
        ]),
        #[cfg(feature = "cuda")]
        Device::Cuda { device_id } => Ok(vec![
            ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ]),
        #[cfg(not(feature = "cuda"))]
        Device::Cuda { .. } => Err(InpaintError::Model(format!(
            "device {device} requested but the cuda feature is not enabled"
        ))),
    }
}

impl InpaintModel for OrtInpainter {
    fn predict(
        &mut self,
        image: ArrayView4<'_, f32>,
        mask: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, InpaintError> {
        let input_shape = image.shape().to_vec();
        let masked = mask_image(image, mask);
        let mask = mask.as_standard_layout();

        let image_tensor = TensorRef::from_array_view(masked.view()).map_err(|err| {
            InpaintError::Inference(format!(
                "failed to convert image tensor {input_shape:?}: {err}"
            ))
        })?;
        let mask_tensor = TensorRef::from_array_view(mask.view()).map_err(|err| {
            InpaintError::Inference(format!("failed to convert mask tensor: {err}"))
        })?;

        let outputs = self
            .session
            .run(ort::inputs![
                self.image_input.as_str() => image_tensor,
                self.mask_input.as_str() => mask_tensor
            ])
            .map_err(|err| {
                InpaintError::Inference(format!(
                    "forward pass of {} failed for input {input_shape:?}: {err}",
                    self.model_path.display()
                ))
            })?;

        let (shape, data) = outputs[self.output.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|err| {
                InpaintError::Inference(format!(
                    "failed to extract output '{}' as f32: {err}",
                    self.output
                ))
            })?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        output_to_unit(&dims, data, self.output_range)
    }

    fn fixed_input_size(&self) -> Option<(usize, usize)> {
        self.fixed_size
    }
}
