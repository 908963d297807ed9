//! Prediction orchestration: configuration, model, sample, refinement, output.

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    InpaintError, InpaintRequest,
    config::{ConfigSource, ModelPaths, PredictConfig, TrainConfig},
    telemetry::TelemetrySink,
};

pub mod batch;
pub mod dataset;
pub mod model;
pub mod postprocess;
pub mod refine;
pub mod tensor;

use model::{InpaintModel, ModelLoader};

/// Removes the masked object from `request.input` and writes `request.output`.
///
/// Returns `Ok(None)` if `interrupt` resolves first; the blocking job is then
/// stopped at its next stage boundary and awaited, so nothing is written after
/// this returns. Every other failure is logged and returned unchanged. Elapsed
/// time is logged on all paths.
#[instrument(skip_all, fields(input = %request.input.display(), output = %request.output.display()))]
pub async fn remove_object<L, I>(
    source: ConfigSource,
    request: InpaintRequest,
    loader: L,
    interrupt: I,
    telemetry: TelemetrySink,
) -> Result<Option<PathBuf>, InpaintError>
where
    L: ModelLoader,
    I: Future<Output = ()>,
{
    let _timer = RunTimer::start(telemetry.clone());
    info!("start loading");

    match predict(source, request, loader, interrupt, telemetry).await {
        Ok(path) => Ok(Some(path)),
        Err(InpaintError::Interrupted) => {
            warn!("interrupted by user");
            Ok(None)
        }
        Err(err) => {
            error!(error = %err, details = ?err, "prediction failed");
            Err(err)
        }
    }
}

async fn predict<L, I>(
    source: ConfigSource,
    request: InpaintRequest,
    loader: L,
    interrupt: I,
    telemetry: TelemetrySink,
) -> Result<PathBuf, InpaintError>
where
    L: ModelLoader,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let interrupter = Interrupter::new();

    let job = tokio::select! {
        job = prepare(source, request, loader, telemetry, interrupter.clone()) => job?,
        () = &mut interrupt => return Err(InpaintError::Interrupted),
    };

    let mut handle = tokio::task::spawn_blocking(move || job.run());
    tokio::select! {
        joined = &mut handle => joined?,
        () = &mut interrupt => {
            interrupter.stop();
            debug!("waiting for the running stage to stop");
            handle.await?
        }
    }
}

async fn prepare<L: ModelLoader>(
    source: ConfigSource,
    request: InpaintRequest,
    loader: L,
    telemetry: TelemetrySink,
    interrupter: Interrupter,
) -> Result<PredictJob<L>, InpaintError> {
    let mask = request.mask_path();
    let config = PredictConfig::compose(&source, &request.image_suffix()).await?;
    let paths = ModelPaths::resolve(&config.model).await?;
    let mut train = TrainConfig::load(&paths.train_config).await?;
    train.prepare_for_prediction();

    Ok(PredictJob {
        config,
        paths,
        train,
        image: request.input,
        mask,
        output: request.output,
        loader,
        telemetry,
        interrupter,
    })
}

/// Cloneable handle asking a running job to stop at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    state: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifies the job that it should stop.
    pub fn stop(&self) {
        self.state.store(true, Ordering::Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.state.load(Ordering::Relaxed)
    }

    /// Fails with [`InpaintError::Interrupted`] once `stop` has been called.
    pub fn check(&self) -> Result<(), InpaintError> {
        if self.should_stop() {
            Err(InpaintError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Blocking part of a prediction, run on the blocking pool.
struct PredictJob<L> {
    config: PredictConfig,
    paths: ModelPaths,
    train: TrainConfig,
    image: PathBuf,
    mask: PathBuf,
    output: PathBuf,
    loader: L,
    telemetry: TelemetrySink,
    interrupter: Interrupter,
}

impl<L: ModelLoader> PredictJob<L> {
    fn run(self) -> Result<PathBuf, InpaintError> {
        let device = self.config.device;
        let model = self.telemetry.time("load_model", || {
            self.loader.load(
                &self.train,
                &self.paths.checkpoint,
                &self.config.model,
                device,
            )
        })?;
        let mut model = ModelSession::new(model);
        info!(%device, checkpoint = %self.paths.checkpoint.display(), "model loaded");
        self.interrupter.check()?;

        let sample = self.telemetry.time("dataset", || {
            dataset::load_sample(&self.image, &self.mask, &self.config.dataset)
        })?;
        self.interrupter.check()?;
        postprocess::ensure_parent_dir(&self.output)?;

        let batch = batch::collate(sample);
        batch.require_unpad_size()?;

        info!(shape = ?batch.image_shape(), "refining");
        let refined = self.telemetry.time("refine", || {
            refine::refine_predict(
                &batch,
                &mut model.model,
                &self.config.refiner,
                &self.interrupter,
            )
        })?;

        let image = postprocess::tensor_to_image(&refined)?;
        self.interrupter.check()?;
        self.telemetry
            .time("write", || postprocess::write_image(&image, &self.output))?;
        info!(path = %self.output.display(), "inpainted image written");
        Ok(self.output)
    }
}

/// Owns the loaded model and logs its release.
struct ModelSession<M: InpaintModel> {
    model: M,
}

impl<M: InpaintModel> ModelSession<M> {
    fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: InpaintModel> Drop for ModelSession<M> {
    fn drop(&mut self) {
        info!("releasing inference session");
    }
}

/// Logs total elapsed time when dropped, whatever the outcome.
struct RunTimer {
    started: Instant,
    telemetry: TelemetrySink,
}

impl RunTimer {
    fn start(telemetry: TelemetrySink) -> Self {
        Self {
            started: Instant::now(),
            telemetry,
        }
    }
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.telemetry.record_stage("total", elapsed);
        info!("prediction took {:.3} seconds", elapsed.as_secs_f64());
    }
}
