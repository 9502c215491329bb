use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::error::{Result, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
}

impl OptimizerKind {
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(format!(
                "unrecognized optimizer '{}' (expected 'adam')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    /// First-moment decay is fixed at 0.9; only the second is configurable.
    pub fn new(learning_rate: f64, beta2: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2,
            epsilon: 1e-8,
        }
    }
}

/// Adam over named parameters. Moments are kept in f32 next to each
/// parameter; parameters that receive no gradient in a step (batch-norm
/// running statistics, frozen layers) are left untouched.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
    steps: usize,
}

impl TrainerOptimizer {
    pub fn new(named_parameters: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        if named_parameters.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::runtime(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            params.push(ParameterSlot {
                name,
                dtype,
                first_moment: Tensor::zeros(shape.as_slice(), DType::F32, device)?,
                second_moment: Tensor::zeros(shape.as_slice(), DType::F32, device)?,
                param: var,
                steps: 0,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of steps that updated at least one parameter.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        let cfg = self.config;
        let mut updated = false;

        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            slot.steps += 1;
            updated = true;

            // Bias correction uses the per-parameter step count.
            let bias_correction1 = 1.0 - cfg.beta1.powi(slot.steps as i32);
            let bias_correction2 = 1.0 - cfg.beta2.powi(slot.steps as i32);
            let scale_m = if bias_correction1.abs() < EPS {
                1.0
            } else {
                1.0 / bias_correction1
            };
            let scale_v = if bias_correction2.abs() < EPS {
                1.0
            } else {
                1.0 / bias_correction2
            };

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let next = slot.param.as_tensor().to_dtype(DType::F32)?.sub(&update)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype)?
            };
            slot.param.set(&next)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        if updated {
            self.step += 1;
        }
        Ok(())
    }
}
