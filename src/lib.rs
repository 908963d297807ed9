//! Core library for single-image LaMa inpainting.
//!
//! The crate exposes configuration composition, the sample and batch data
//! model, the model and refinement seams, and the orchestration entry point
//! used by the CLI application.

pub mod config;
pub mod pipeline;
pub mod telemetry;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

use crate::{config::ConfigSource, pipeline::model::OrtModelLoader, telemetry::TelemetrySink};

/// Errors returned by configuration, loading and inference steps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InpaintError {
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dataset failure: {0}")]
    Dataset(String),
    #[error("image failure: {0}")]
    Image(String),
    #[error("model failure: {0}")]
    Model(String),
    #[error("inference failure: {0}")]
    Inference(String),
    #[error("unpadded size is required for the refinement")]
    MissingUnpadSize,
    #[error("interrupted by user")]
    Interrupted,
    #[error("task join failure: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for InpaintError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

/// Paths describing a single inpainting job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InpaintRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Explicit mask; derived from `input` when absent.
    pub mask: Option<PathBuf>,
}

impl InpaintRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: impl Into<PathBuf>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    /// Returns the explicit mask or `<input without extension>_mask.png`.
    pub fn mask_path(&self) -> PathBuf {
        self.mask
            .clone()
            .unwrap_or_else(|| default_mask_path(&self.input))
    }

    /// Extension of the input image including the leading dot, or empty.
    pub fn image_suffix(&self) -> String {
        self.input
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Derives the conventional mask location for an input image.
pub fn default_mask_path(input: &Path) -> PathBuf {
    let mut path = input.with_extension("").into_os_string();
    path.push("_mask.png");
    PathBuf::from(path)
}

/// Runs one inpainting job with the ONNX Runtime backend.
///
/// Returns `Ok(None)` when the user interrupts the run with Ctrl-C, once the
/// running stage has stopped and the session is released.
#[instrument(skip_all, fields(input = %request.input.display()))]
pub async fn run(
    source: ConfigSource,
    request: InpaintRequest,
) -> Result<Option<PathBuf>, InpaintError> {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No handler could be installed; never report an interruption.
            std::future::pending::<()>().await;
        }
    };
    pipeline::remove_object(
        source,
        request,
        OrtModelLoader,
        interrupt,
        TelemetrySink::default(),
    )
    .await
}
