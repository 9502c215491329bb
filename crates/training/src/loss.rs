use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::{Result, TrainingError};

/// Loss family used by a training session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionKind {
    CrossEntropy,
    Mse,
}

impl CriterionKind {
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "crossentropy" | "cross_entropy" | "ce" => Ok(CriterionKind::CrossEntropy),
            "mse" => Ok(CriterionKind::Mse),
            other => Err(format!(
                "unrecognized criterion '{}' (expected 'crossentropy' or 'MSE')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    Sum,
}

/// A loss callable: `compute(logits, targets)` yields a scalar tensor that
/// stays attached to the autograd graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    kind: CriterionKind,
    reduction: Reduction,
}

impl Criterion {
    pub fn new(kind: CriterionKind, reduction: Reduction) -> Self {
        Self { kind, reduction }
    }

    pub fn kind(&self) -> CriterionKind {
        self.kind
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "criterion expects logits shaped (batch, classes), found {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime("criterion received an empty batch"));
        }
        let targets = targets.to_device(logits.device())?;

        match self.kind {
            CriterionKind::CrossEntropy => self.cross_entropy(logits, &targets, batch),
            CriterionKind::Mse => self.squared_error(logits, &targets, batch, classes),
        }
    }

    fn cross_entropy(&self, logits: &Tensor, targets: &Tensor, batch: usize) -> Result<Tensor> {
        let log_probs = ops::log_softmax(logits, D::Minus1)?;

        let per_example = if targets.dtype().is_float() {
            // Soft labels: one probability row per example.
            if targets.dims() != logits.dims() {
                return Err(TrainingError::runtime(format!(
                    "soft targets must match logits shape {:?}, found {:?}",
                    logits.dims(),
                    targets.dims()
                )));
            }
            let targets = targets.to_dtype(log_probs.dtype())?;
            (targets * &log_probs)?.sum(1)?.neg()?
        } else {
            let labels = class_indices(targets, batch)?;
            log_probs
                .gather(&labels.unsqueeze(1)?, 1)?
                .neg()?
                .squeeze(1)?
        };

        self.reduce(&per_example)
    }

    fn squared_error(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        batch: usize,
        classes: usize,
    ) -> Result<Tensor> {
        let targets = if targets.dtype().is_float() {
            if targets.dims() != logits.dims() {
                return Err(TrainingError::runtime(format!(
                    "regression targets must match logits shape {:?}, found {:?}",
                    logits.dims(),
                    targets.dims()
                )));
            }
            targets.to_dtype(logits.dtype())?
        } else {
            one_hot(&class_indices(targets, batch)?, classes)?.to_dtype(logits.dtype())?
        };

        let squared = (logits - targets)?.sqr()?;
        self.reduce(&squared)
    }

    fn reduce(&self, values: &Tensor) -> Result<Tensor> {
        let reduced = match self.reduction {
            Reduction::Sum => values.sum_all()?,
            Reduction::Mean => values.mean_all()?,
        };
        Ok(reduced)
    }
}

/// Returns the `(mean, sum)` criterion pair for `kind`. Accumulation uses the
/// sum variant so per-example averaging stays exact with ragged final batches.
pub fn select_criterion(kind: &str) -> Result<(Criterion, Criterion)> {
    let kind = CriterionKind::parse(kind)
        .map_err(|message| TrainingError::configuration("model.criterion", message))?;
    Ok(criterion_pair(kind))
}

pub fn criterion_pair(kind: CriterionKind) -> (Criterion, Criterion) {
    (
        Criterion::new(kind, Reduction::Mean),
        Criterion::new(kind, Reduction::Sum),
    )
}

/// Integer class labels as a `(batch,)` u32 tensor.
pub(crate) fn class_indices(targets: &Tensor, batch: usize) -> Result<Tensor> {
    let flat = targets.flatten_all()?.contiguous()?;
    if flat.elem_count() != batch {
        return Err(TrainingError::runtime(format!(
            "expected {} class labels, found target shape {:?}",
            batch,
            targets.dims()
        )));
    }
    match flat.dtype() {
        DType::U32 => Ok(flat),
        DType::I64 | DType::U8 => Ok(flat.to_dtype(DType::U32)?),
        dtype => Err(TrainingError::runtime(format!(
            "unsupported label dtype {:?}",
            dtype
        ))),
    }
}

fn one_hot(labels: &Tensor, classes: usize) -> Result<Tensor> {
    let columns = Tensor::arange(0u32, classes as u32, labels.device())?.unsqueeze(0)?;
    Ok(labels.unsqueeze(1)?.broadcast_eq(&columns)?)
}
