use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    device::DeviceSpec,
    error::{ConfigIssue, Result, TrainingError},
    loss::CriterionKind,
    optimizer::OptimizerKind,
    scheduler::SchedulerKind,
};

/// Session configuration, read once before training starts and never mutated
/// by the engine afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub training: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_path(path)
    }

    /// Parses an inline TOML document. Relative paths are kept as written.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TrainingConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.model.name.trim().is_empty() {
            issues.push(ConfigIssue::new("model.name", "must not be empty"));
        }
        if let Err(err) = self.criterion_kind() {
            issues.extend(err.issues().iter().cloned());
        }
        if let Err(err) = self.optimizer_kind() {
            issues.extend(err.issues().iter().cloned());
        }
        if let Err(err) = self.scheduler_kind() {
            issues.extend(err.issues().iter().cloned());
        }

        let hyper = &self.model.hyper;
        if !(hyper.lr > 0.0) {
            issues.push(ConfigIssue::new("model.hyper.lr", "must be greater than 0"));
        }
        if !(0.0 < hyper.beta2 && hyper.beta2 < 1.0) {
            issues.push(ConfigIssue::new("model.hyper.beta2", "must be in (0, 1)"));
        }
        if !(hyper.gamma > 0.0) {
            issues.push(ConfigIssue::new("model.hyper.gamma", "must be greater than 0"));
        }
        if hyper.epochs == 0 {
            issues.push(ConfigIssue::new("model.hyper.epochs", "must be greater than 0"));
        }
        if hyper.patience == 0 {
            issues.push(ConfigIssue::new(
                "model.hyper.patience",
                "must be greater than 0",
            ));
        }
        if hyper.batch_size == 0 {
            issues.push(ConfigIssue::new(
                "model.hyper.batch_size",
                "must be greater than 0",
            ));
        }
        if !(0.0..1.0).contains(&hyper.dropout) {
            issues.push(ConfigIssue::new("model.hyper.dropout", "must be in [0, 1)"));
        }
        if hyper.kernel_size == 0 || hyper.stride == 0 {
            issues.push(ConfigIssue::new(
                "model.hyper.kernel_size",
                "kernel_size and stride must be greater than 0",
            ));
        }

        if self.dataset.n_classes == 0 {
            issues.push(ConfigIssue::new(
                "dataset.n_classes",
                "must be greater than 0",
            ));
        }
        if self.dataset.input_size.len() != 3 || self.dataset.input_size.contains(&0) {
            issues.push(ConfigIssue::new(
                "dataset.input_size",
                format!(
                    "expected [channels, height, width] with non-zero entries, found {:?}",
                    self.dataset.input_size
                ),
            ));
        }

        if self.training.evaluate_freq == 0 {
            issues.push(ConfigIssue::new(
                "training.evaluate_freq",
                "must be greater than 0",
            ));
        }
        if self.training.verbose > 2 {
            issues.push(ConfigIssue::new(
                "training.verbose",
                format!("must be 0, 1 or 2 (got {})", self.training.verbose),
            ));
        }
        if let Err(err) = self.device_spec() {
            issues.extend(err.issues().iter().cloned());
        }
        if self.training.tracking.flush_every_n == 0 {
            issues.push(ConfigIssue::new(
                "training.tracking.flush_every_n",
                "must be greater than 0",
            ));
        }
        if self.training.save_dir.as_os_str().is_empty() {
            issues.push(ConfigIssue::new("training.save_dir", "must not be empty"));
        }
        if self.explicit_save_name().is_none() && !self.training.tracking.track {
            issues.push(missing_save_name());
        }

        if !issues.is_empty() {
            return Err(TrainingError::Configuration(issues));
        }

        Ok(())
    }

    pub fn criterion_kind(&self) -> Result<CriterionKind> {
        CriterionKind::parse(&self.model.criterion).map_err(|message| {
            TrainingError::configuration("model.criterion", message)
        })
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind> {
        OptimizerKind::parse(&self.model.optimizer).map_err(|message| {
            TrainingError::configuration("model.optimizer", message)
        })
    }

    /// `None` when no learning-rate schedule is configured.
    pub fn scheduler_kind(&self) -> Result<Option<SchedulerKind>> {
        SchedulerKind::parse(self.model.lr_scheduler.as_deref()).map_err(|message| {
            TrainingError::configuration("model.lr_scheduler", message)
        })
    }

    pub fn device_spec(&self) -> Result<DeviceSpec> {
        DeviceSpec::parse(&self.training.device)
            .map_err(|message| TrainingError::configuration("training.device", message))
    }

    /// Name under which the best checkpoint of a session is stored: the explicit
    /// `save_as`, else the tracking run name (generated when tracking is on but
    /// no run name was configured).
    pub fn resolve_save_name(&self) -> Result<String> {
        if let Some(name) = self.explicit_save_name() {
            return Ok(name.to_string());
        }
        if self.training.tracking.track {
            return Ok(self
                .training
                .tracking
                .run_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(generated_run_name));
        }
        Err(TrainingError::Configuration(vec![missing_save_name()]))
    }

    fn explicit_save_name(&self) -> Option<&str> {
        self.training
            .save_as
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.dataset.apply_base_path(base);
        self.training.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_criterion")]
    pub criterion: String,
    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    #[serde(default)]
    pub lr_scheduler: Option<String>,
    #[serde(default)]
    pub hyper: HyperParameters,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            criterion: default_criterion(),
            optimizer: default_optimizer(),
            lr_scheduler: None,
            hyper: HyperParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParameters {
    #[serde(default = "default_learning_rate")]
    pub lr: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default)]
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_n_neurons")]
    pub n_neurons: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default = "default_n_depth")]
    pub n_depth: usize,
    #[serde(default = "default_linear_output_size")]
    pub linear_output_size: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            lr: default_learning_rate(),
            beta2: default_beta2(),
            milestones: Vec::new(),
            gamma: default_gamma(),
            epochs: default_epochs(),
            patience: default_patience(),
            batch_size: default_batch_size(),
            n_neurons: default_n_neurons(),
            kernel_size: default_kernel_size(),
            stride: default_stride(),
            n_depth: default_n_depth(),
            linear_output_size: default_linear_output_size(),
            dropout: default_dropout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_name")]
    pub dataset: String,
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,
    #[serde(default = "default_input_size")]
    pub input_size: Vec<usize>,
    #[serde(default)]
    pub train_path: Option<PathBuf>,
    #[serde(default)]
    pub val_path: Option<PathBuf>,
    #[serde(default)]
    pub test_path: Option<PathBuf>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset_name(),
            n_classes: default_n_classes(),
            input_size: default_input_size(),
            train_path: None,
            val_path: None,
            test_path: None,
        }
    }
}

impl DatasetConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.train_path.as_mut(),
            self.val_path.as_mut(),
            self.test_path.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_true")]
    pub replicate: bool,
    #[serde(default)]
    pub save_as: Option<String>,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default = "default_evaluate_freq")]
    pub evaluate_freq: usize,
    #[serde(default = "default_verbose")]
    pub verbose: u8,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_true")]
    pub drop_last: bool,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            replicate: true,
            save_as: None,
            save_dir: default_save_dir(),
            evaluate_freq: default_evaluate_freq(),
            verbose: default_verbose(),
            seed: default_seed(),
            shuffle: true,
            drop_last: true,
            tracking: TrackingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.save_dir, base);
        if let Some(dir) = self.tracking.directory.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub track: bool,
    #[serde(default)]
    pub run_name: Option<String>,
    /// Event-file directory; defaults to `<save_dir>/runs/<save name>`.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            track: false,
            run_name: None,
            directory: None,
            flush_every_n: default_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn missing_save_name() -> ConfigIssue {
    ConfigIssue::new(
        "training.save_as",
        "a checkpoint name is required when tracking is disabled",
    )
}

fn generated_run_name() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("run-{timestamp}")
}

fn default_model_name() -> String {
    "cnn".to_string()
}

fn default_criterion() -> String {
    "crossentropy".to_string()
}

fn default_optimizer() -> String {
    "adam".to_string()
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta2() -> f64 {
    0.999
}

fn default_gamma() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    10
}

fn default_patience() -> usize {
    5
}

fn default_batch_size() -> usize {
    64
}

fn default_n_neurons() -> usize {
    32
}

fn default_kernel_size() -> usize {
    3
}

fn default_stride() -> usize {
    1
}

fn default_n_depth() -> usize {
    1
}

fn default_linear_output_size() -> usize {
    128
}

fn default_dropout() -> f32 {
    0.5
}

fn default_dataset_name() -> String {
    "custom".to_string()
}

fn default_n_classes() -> usize {
    10
}

fn default_input_size() -> Vec<usize> {
    vec![1, 28, 28]
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("saved_models")
}

fn default_evaluate_freq() -> usize {
    1
}

fn default_verbose() -> u8 {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_flush_every_n() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [model]
        name = "mlp"
        criterion = "crossentropy"
        optimizer = "adam"

        [model.hyper]
        lr = 0.01
        epochs = 3

        [dataset]
        n_classes = 4
        input_size = [1, 2, 2]

        [training]
        save_as = "unit"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() -> anyhow::Result<()> {
        let config = TrainingConfig::from_toml_str(MINIMAL)?;
        assert_eq!(config.model.hyper.epochs, 3);
        assert_eq!(config.model.hyper.patience, default_patience());
        assert_eq!(config.training.evaluate_freq, 1);
        assert_eq!(config.resolve_save_name()?, "unit");
        assert!(config.scheduler_kind()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_optimizer_is_a_configuration_error() {
        let source = MINIMAL.replace("optimizer = \"adam\"", "optimizer = \"sgd\"");
        let err = TrainingConfig::from_toml_str(&source).unwrap_err();
        assert!(err.is_configuration());
        assert!(err
            .issues()
            .iter()
            .any(|issue| issue.field == "model.optimizer"));
    }

    #[test]
    fn issues_are_collected_together() {
        let source = MINIMAL
            .replace("criterion = \"crossentropy\"", "criterion = \"hinge\"")
            .replace("lr = 0.01", "lr = 0.0");
        let err = TrainingConfig::from_toml_str(&source).unwrap_err();
        let fields: Vec<_> = err.issues().iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"model.criterion"));
        assert!(fields.contains(&"model.hyper.lr"));
    }

    #[test]
    fn save_name_falls_back_to_tracking_run_name() -> anyhow::Result<()> {
        let mut config = TrainingConfig::from_toml_str(MINIMAL)?;
        config.training.save_as = None;
        config.training.tracking.track = true;
        config.training.tracking.run_name = Some("bright-sun-7".into());
        assert_eq!(config.resolve_save_name()?, "bright-sun-7");

        config.training.tracking.run_name = None;
        assert!(config.resolve_save_name()?.starts_with("run-"));

        config.training.tracking.track = false;
        let err = config.resolve_save_name().unwrap_err();
        assert_eq!(err.issues()[0].field, "training.save_as");
        Ok(())
    }

    #[test]
    fn relative_paths_resolve_against_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.toml");
        let source = MINIMAL.replace(
            "n_classes = 4",
            "n_classes = 4\ntrain_path = \"data/train.safetensors\"",
        );
        fs::write(&path, source)?;

        let config = TrainingConfig::from_path(&path)?;
        assert_eq!(
            config.dataset.train_path.as_deref(),
            Some(dir.path().join("data/train.safetensors").as_path())
        );
        assert_eq!(config.training.save_dir, dir.path().join("saved_models"));
        Ok(())
    }

    #[test]
    fn json_configs_are_accepted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.json");
        let config = TrainingConfig::from_toml_str(MINIMAL)?;
        fs::write(&path, serde_json::to_string(&config)?)?;
        let reloaded = TrainingConfig::from_path(&path)?;
        assert_eq!(reloaded.model.name, "mlp");
        assert_eq!(reloaded.dataset.n_classes, 4);
        Ok(())
    }
}
