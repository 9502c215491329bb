use crate::{
    config::HyperParameters,
    error::{Result, TrainingError},
};

/// Learning-rate schedule advanced once per completed epoch.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the learning rate for the next one.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    MultiStep,
}

impl SchedulerKind {
    /// Absent, empty and `none` all mean no schedule.
    pub fn parse(value: Option<&str>) -> std::result::Result<Option<Self>, String> {
        let Some(value) = value else {
            return Ok(None);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            "multisteplr" | "multistep" | "multi_step" => Ok(Some(SchedulerKind::MultiStep)),
            other => Err(format!(
                "unrecognized learning rate scheduler '{}' (expected 'MultiStepLR')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    MultiStep {
        base_lr: f64,
        milestones: Vec<usize>,
        gamma: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(kind: SchedulerKind, hyper: &HyperParameters) -> Result<Self> {
        match kind {
            SchedulerKind::MultiStep => {
                if !(hyper.gamma > 0.0) {
                    return Err(TrainingError::configuration(
                        "model.hyper.gamma",
                        "must be greater than 0",
                    ));
                }
                Ok(SchedulerConfig::MultiStep {
                    base_lr: hyper.lr,
                    milestones: hyper.milestones.clone(),
                    gamma: hyper.gamma,
                })
            }
        }
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        match self {
            SchedulerConfig::MultiStep {
                base_lr,
                milestones,
                gamma,
            } => Box::new(MultiStepDecay::new(base_lr, milestones, gamma)),
        }
    }
}

/// Multiplies the base rate by `gamma` once for every milestone reached, so
/// after `n` epochs the rate is `base * gamma^(milestones <= n)`. Repeated
/// milestones decay repeatedly.
#[derive(Debug, Clone)]
pub struct MultiStepDecay {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
    current_lr: f64,
}

impl MultiStepDecay {
    pub fn new(base_lr: f64, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
            current_lr: base_lr,
        }
    }

    fn compute_lr(&self, epoch: usize) -> f64 {
        let reached = self.milestones.iter().take_while(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(reached as i32)
    }
}

impl LRScheduler for MultiStepDecay {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.current_lr = self.compute_lr(self.epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
