use candle_core::{Tensor, D};

use crate::{error::Result, loss::class_indices};

/// Running sums over an evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    examples: u64,
    correct: u64,
}

impl EvaluationMetrics {
    /// `loss_sum` is the sum-reduced loss of the batch, not its mean.
    pub fn update(&mut self, loss_sum: f64, examples: u64, correct: u64) {
        self.loss_sum += loss_sum;
        self.examples += examples;
        self.correct += correct;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.examples == 0 {
            None
        } else {
            Some(EvaluationSummary {
                average_loss: self.loss_sum / self.examples as f64,
                accuracy: self.correct as f64 / self.examples as f64,
                examples: self.examples,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub accuracy: f64,
    pub examples: u64,
}

/// Number of rows whose argmax matches the target class. One-hot or
/// probability targets are reduced with argmax as well.
pub fn count_correct(logits: &Tensor, targets: &Tensor) -> Result<u64> {
    let predictions = logits.argmax(D::Minus1)?;
    let batch = predictions.elem_count();
    let labels = if targets.dtype().is_float() && targets.rank() == 2 {
        targets.argmax(D::Minus1)?
    } else {
        class_indices(targets, batch)?
    };
    let labels = labels.to_device(predictions.device())?;
    let correct = predictions
        .eq(&labels)?
        .to_dtype(candle_core::DType::U32)?
        .sum_all()?
        .to_vec0::<u32>()?;
    Ok(correct as u64)
}

/// What happened in one epoch of a training session.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub train_loss: f64,
    pub learning_rate: f64,
    pub validation: Option<EvaluationSummary>,
    pub train_evaluation: Option<EvaluationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn averages_are_per_example() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(3.0, 3, 2);
        metrics.update(1.0, 1, 1);
        let summary = metrics.finalize().unwrap();
        assert_eq!(summary.average_loss, 1.0);
        assert_eq!(summary.accuracy, 0.75);
        assert_eq!(summary.examples, 4);
        assert!(EvaluationMetrics::default().finalize().is_none());
    }

    #[test]
    fn counts_argmax_hits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &device)?;
        let labels = Tensor::new(&[1u32, 1, 1], &device)?;
        assert_eq!(count_correct(&logits, &labels)?, 2);

        let one_hot = Tensor::new(&[[0f32, 1.], [1., 0.], [1., 0.]], &device)?;
        assert_eq!(count_correct(&logits, &one_hot)?, 2);
        Ok(())
    }
}
