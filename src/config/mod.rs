//! Configuration composition and validation utilities.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, instrument};

use crate::{InpaintError, InpaintRequest};

/// Default location of the prediction profile.
pub const DEFAULT_PROFILE: &str = "configs/prediction/default.toml";
/// Training configuration file expected inside the model directory.
pub const TRAIN_CONFIG_FILE: &str = "config.yaml";
/// Sub-directory of the model directory holding checkpoints.
pub const CHECKPOINT_DIR: &str = "models";

/// Command-line arguments used to bootstrap a prediction.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Remove objects from an image with LaMa inpainting")]
pub struct CliArgs {
    /// Image to inpaint.
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,
    /// Where the inpainted image is written.
    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,
    /// Mask image; defaults to `<input stem>_mask.png`.
    #[arg(long, value_name = "PATH")]
    pub mask: Option<PathBuf>,
    /// Prediction profile to compose the configuration from.
    #[arg(
        long,
        value_name = "PATH",
        env = "LAMAFILL_CONFIG",
        default_value = DEFAULT_PROFILE
    )]
    pub config: PathBuf,
    /// Device override (`cpu`, `cuda`, `cuda:N`).
    #[arg(long, value_name = "DEVICE", env = "LAMAFILL_DEVICE")]
    pub device: Option<String>,
    /// Model directory override.
    #[arg(long, value_name = "PATH", env = "LAMAFILL_MODEL_PATH")]
    pub model_path: Option<PathBuf>,
    /// Dotted configuration overrides such as `refiner.max_scales=2`.
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<Override>,
}

impl CliArgs {
    /// Splits the arguments into the configuration source and the job paths.
    pub fn into_job(self) -> (ConfigSource, InpaintRequest) {
        let mut overrides = self.overrides;
        if let Some(path) = self.model_path {
            overrides.push(Override::new(
                "model.path",
                toml::Value::String(path.to_string_lossy().into_owned()),
            ));
        }
        if let Some(device) = self.device {
            overrides.push(Override::new("device", toml::Value::String(device)));
        }
        let request = InpaintRequest {
            input: self.input,
            output: self.output,
            mask: self.mask,
        };
        (
            ConfigSource {
                profile: self.config,
                overrides,
            },
            request,
        )
    }
}

/// Inputs the prediction configuration is composed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSource {
    pub profile: PathBuf,
    pub overrides: Vec<Override>,
}

impl ConfigSource {
    pub fn new(profile: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, entry: Override) -> Self {
        self.overrides.push(entry);
        self
    }
}

/// A single `dotted.key=value` assignment applied on top of the profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    path: Vec<String>,
    value: toml::Value,
}

impl Override {
    pub fn new(key: &str, value: toml::Value) -> Self {
        Self {
            path: key.split('.').map(str::to_string).collect(),
            value,
        }
    }

    pub fn key(&self) -> String {
        self.path.join(".")
    }

    pub fn value(&self) -> &toml::Value {
        &self.value
    }

    /// Writes the value into `root`, creating intermediate tables.
    pub fn apply(&self, root: &mut toml::Table) -> Result<(), InpaintError> {
        let Some((last, parents)) = self.path.split_last() else {
            return Err(InpaintError::Config("empty override key".to_string()));
        };
        let mut table = root;
        for segment in parents {
            let entry = table
                .entry(segment.clone())
                .or_insert(toml::Value::Table(toml::Table::new()));
            table = entry.as_table_mut().ok_or_else(|| {
                InpaintError::Config(format!(
                    "cannot override '{}': '{segment}' is not a table",
                    self.key()
                ))
            })?;
        }
        table.insert(last.clone(), self.value.clone());
        Ok(())
    }
}

impl FromStr for Override {
    type Err = InpaintError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            InpaintError::Config(format!("override '{raw}' must look like key=value"))
        })?;
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(InpaintError::Config(format!(
                "override '{raw}' has an invalid key"
            )));
        }
        Ok(Self::new(key, parse_scalar(value.trim())))
    }
}

impl Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key(), self.value)
    }
}

/// Parses a TOML scalar, falling back to a bare string.
fn parse_scalar(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Device the model session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl FromStr for Device {
    type Err = InpaintError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda { device_id: 0 }),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(|device_id| Device::Cuda { device_id })
                .ok_or_else(|| InpaintError::Config(format!("unsupported device '{raw}'"))),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = InpaintError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Value range produced by the model's output tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRange {
    /// Values in `[0, 1]`.
    #[default]
    Unit,
    /// Values in `[0, 255]`.
    Byte,
}

/// Model location and tensor bindings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub checkpoint: String,
    #[serde(default = "default_image_input")]
    pub image_input: String,
    #[serde(default = "default_mask_input")]
    pub mask_input: String,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default)]
    pub output_range: OutputRange,
    /// Intra-op thread count for the session; runtime default when unset.
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

fn default_image_input() -> String {
    "image".to_string()
}

fn default_mask_input() -> String {
    "mask".to_string()
}

fn default_output() -> String {
    "output".to_string()
}

/// Dataset flavours understood by the sample loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[default]
    Default,
}

/// Options forwarded to the single-sample loader.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DatasetConfig {
    #[serde(default)]
    pub kind: DatasetKind,
    /// Pads image and mask up to a multiple of this value and records the
    /// original size. Values `<= 1` disable padding.
    #[serde(default)]
    pub pad_out_to_modulo: Option<usize>,
    #[serde(default)]
    pub scale_factor: Option<f32>,
}

/// Options of the multi-scale refinement pass.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RefinerConfig {
    #[serde(default = "default_modulo")]
    pub modulo: usize,
    #[serde(default = "default_min_side")]
    pub min_side: usize,
    #[serde(default = "default_max_scales")]
    pub max_scales: usize,
    #[serde(default = "default_px_budget")]
    pub px_budget: usize,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            modulo: default_modulo(),
            min_side: default_min_side(),
            max_scales: default_max_scales(),
            px_budget: default_px_budget(),
        }
    }
}

fn default_modulo() -> usize {
    8
}

fn default_min_side() -> usize {
    512
}

fn default_max_scales() -> usize {
    3
}

fn default_px_budget() -> usize {
    1_800_000
}

/// Fully composed prediction configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PredictConfig {
    pub model: ModelConfig,
    #[serde(default = "default_device")]
    pub device: Device,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub refiner: RefinerConfig,
    #[serde(default)]
    pub img_suffix: String,
}

fn default_device() -> Device {
    Device::Cpu
}

impl PredictConfig {
    /// Reads the profile and composes it with the image suffix and overrides.
    #[instrument(skip_all, fields(profile = %source.profile.display()))]
    pub async fn compose(source: &ConfigSource, img_suffix: &str) -> Result<Self, InpaintError> {
        let raw = fs::read_to_string(&source.profile).await.map_err(|err| {
            InpaintError::Config(format!(
                "failed to read profile {}: {err}",
                source.profile.display()
            ))
        })?;
        Self::from_profile_str(&raw, img_suffix, &source.overrides)
    }

    /// Composes a configuration from profile text.
    pub fn from_profile_str(
        raw: &str,
        img_suffix: &str,
        overrides: &[Override],
    ) -> Result<Self, InpaintError> {
        let mut tree: toml::Table = toml::from_str(raw)
            .map_err(|err| InpaintError::Config(format!("invalid profile document: {err}")))?;
        tree.insert(
            "img_suffix".to_string(),
            toml::Value::String(img_suffix.to_string()),
        );
        for entry in overrides {
            debug!(%entry, "applying override");
            entry.apply(&mut tree)?;
        }
        let config: PredictConfig = toml::Value::Table(tree)
            .try_into()
            .map_err(|err| InpaintError::Config(format!("invalid prediction config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InpaintError> {
        if self.model.checkpoint.trim().is_empty() {
            return Err(InpaintError::Config(
                "model.checkpoint must name a checkpoint file".to_string(),
            ));
        }
        if self.model.intra_threads == Some(0) {
            return Err(InpaintError::Config(
                "model.intra_threads must be positive".to_string(),
            ));
        }
        if self.refiner.modulo == 0 {
            return Err(InpaintError::Config(
                "refiner.modulo must be positive".to_string(),
            ));
        }
        if self.refiner.max_scales == 0 || self.refiner.min_side == 0 {
            return Err(InpaintError::Config(
                "refiner.max_scales and refiner.min_side must be positive".to_string(),
            ));
        }
        if self.refiner.px_budget == 0 {
            return Err(InpaintError::Config(
                "refiner.px_budget must be positive".to_string(),
            ));
        }
        if let Some(factor) = self.dataset.scale_factor {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(InpaintError::Config(format!(
                    "dataset.scale_factor must be positive, got {factor}"
                )));
            }
        }
        Ok(())
    }
}

/// Files resolved inside the model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub train_config: PathBuf,
    pub checkpoint: PathBuf,
}

impl ModelPaths {
    /// Resolves `config.yaml` and `models/<checkpoint>`, failing if either is missing.
    pub async fn resolve(model: &ModelConfig) -> Result<Self, InpaintError> {
        let paths = Self {
            root: model.path.clone(),
            train_config: model.path.join(TRAIN_CONFIG_FILE),
            checkpoint: model.path.join(CHECKPOINT_DIR).join(&model.checkpoint),
        };
        for file in [&paths.train_config, &paths.checkpoint] {
            ensure_file(&paths.root, file).await?;
        }
        Ok(paths)
    }
}

async fn ensure_file(root: &Path, file: &Path) -> Result<(), InpaintError> {
    match fs::metadata(file).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(InpaintError::Config(format!(
            "model directory {} is missing {}",
            root.display(),
            file.display()
        ))),
    }
}

/// Section of the training config describing the trained module.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TrainingModelSection {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub predict_only: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VisualizerSection {
    #[serde(default = "default_visualizer")]
    pub kind: String,
}

impl Default for VisualizerSection {
    fn default() -> Self {
        Self {
            kind: default_visualizer(),
        }
    }
}

fn default_visualizer() -> String {
    "directory".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct GeneratorSection {
    #[serde(default)]
    pub kind: Option<String>,
}

/// Training-time configuration stored next to the checkpoint.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TrainConfig {
    #[serde(default)]
    pub training_model: TrainingModelSection,
    #[serde(default)]
    pub visualizer: VisualizerSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TrainConfig {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, InpaintError> {
        let raw = fs::read_to_string(path).await.map_err(|err| {
            InpaintError::Config(format!(
                "failed to read training config {}: {err}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, InpaintError> {
        // An empty document deserializes to unit, not a mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
            .map_err(|err| InpaintError::Config(format!("invalid training config: {err}")))
    }

    /// Switches the training config into inference mode.
    pub fn prepare_for_prediction(&mut self) {
        self.training_model.predict_only = true;
        self.visualizer.kind = "noop".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
device = "cpu"

[model]
path = "models/big-lama"
checkpoint = "best.onnx"

[dataset]
pad_out_to_modulo = 8
"#;

    #[test]
    fn override_parses_scalars() {
        let entry: Override = "refiner.max_scales=2".parse().expect("parse");
        assert_eq!(entry.key(), "refiner.max_scales");
        assert_eq!(entry.value(), &toml::Value::Integer(2));

        let entry: Override = "model.path=/srv/lama".parse().expect("parse");
        assert_eq!(entry.value(), &toml::Value::String("/srv/lama".into()));
    }

    #[test]
    fn override_rejects_bad_keys() {
        assert!("novalue".parse::<Override>().is_err());
        assert!("a..b=1".parse::<Override>().is_err());
        assert!("=1".parse::<Override>().is_err());
    }

    #[test]
    fn override_cannot_descend_into_scalar() {
        let mut tree: toml::Table = toml::from_str("device = \"cpu\"").expect("toml");
        let entry: Override = "device.id=1".parse().expect("parse");
        let err = entry.apply(&mut tree).expect_err("scalar parent");
        assert!(err.to_string().contains("not a table"));
    }

    #[test]
    fn profile_composes_suffix_and_defaults() {
        let config = PredictConfig::from_profile_str(PROFILE, ".jpg", &[]).expect("compose");
        assert_eq!(config.img_suffix, ".jpg");
        assert_eq!(config.model.image_input, "image");
        assert_eq!(config.model.output_range, OutputRange::Unit);
        assert_eq!(config.dataset.pad_out_to_modulo, Some(8));
        assert_eq!(config.refiner, RefinerConfig::default());
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides: Vec<Override> = vec![
            "device=cuda:1".parse().expect("parse"),
            "refiner.px_budget=1000".parse().expect("parse"),
        ];
        let config = PredictConfig::from_profile_str(PROFILE, ".png", &overrides).expect("compose");
        assert_eq!(config.device, Device::Cuda { device_id: 1 });
        assert_eq!(config.refiner.px_budget, 1000);
    }

    #[test]
    fn invalid_refiner_values_fail() {
        let overrides: Vec<Override> = vec!["refiner.modulo=0".parse().expect("parse")];
        let err = PredictConfig::from_profile_str(PROFILE, ".png", &overrides)
            .expect_err("zero modulo");
        assert!(err.to_string().contains("modulo"));
    }

    #[test]
    fn intra_threads_are_optional_but_positive() {
        let config = PredictConfig::from_profile_str(PROFILE, ".png", &[]).expect("compose");
        assert_eq!(config.model.intra_threads, None);

        let overrides: Vec<Override> = vec!["model.intra_threads=1".parse().expect("parse")];
        let config = PredictConfig::from_profile_str(PROFILE, ".png", &overrides).expect("compose");
        assert_eq!(config.model.intra_threads, Some(1));

        let overrides: Vec<Override> = vec!["model.intra_threads=0".parse().expect("parse")];
        let err = PredictConfig::from_profile_str(PROFILE, ".png", &overrides)
            .expect_err("zero threads");
        assert!(err.to_string().contains("intra_threads"));
    }

    #[test]
    fn device_parsing() {
        assert_eq!("CPU".parse::<Device>().expect("cpu"), Device::Cpu);
        assert_eq!(
            "cuda".parse::<Device>().expect("cuda"),
            Device::Cuda { device_id: 0 }
        );
        assert_eq!(
            "cuda:3".parse::<Device>().expect("cuda:3"),
            Device::Cuda { device_id: 3 }
        );
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:-1".parse::<Device>().is_err());
        assert_eq!(Device::Cuda { device_id: 2 }.to_string(), "cuda:2");
    }

    #[test]
    fn train_config_switches_to_prediction() {
        let raw = r#"
training_model:
  kind: default
  predict_only: false
visualizer:
  kind: directory
generator:
  kind: ffc_resnet
losses:
  l1:
    weight_missing: 0
"#;
        let mut config = TrainConfig::from_yaml_str(raw).expect("yaml");
        assert_eq!(config.generator.kind.as_deref(), Some("ffc_resnet"));
        assert!(config.extra.contains_key("losses"));
        config.prepare_for_prediction();
        assert!(config.training_model.predict_only);
        assert_eq!(config.visualizer.kind, "noop");
    }

    #[test]
    fn cli_overrides_are_appended() {
        let cli = CliArgs::parse_from([
            "lamafill",
            "--input",
            "in.jpg",
            "--output",
            "out/res.png",
            "--device",
            "cuda:0",
            "--model-path",
            "/models/lama",
            "refiner.max_scales=1",
        ]);
        let (source, request) = cli.into_job();
        assert_eq!(request.mask, None);
        let keys: Vec<_> = source.overrides.iter().map(Override::key).collect();
        assert_eq!(keys, ["refiner.max_scales", "model.path", "device"]);
    }
}
