use candle_core::Tensor;

use crate::{error::Result, model::TrainableClassifier};

/// Counters at the moment a hook fires. Passed by value, so hooks cannot
/// move the trainer's step or epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext {
    pub epoch: usize,
    pub global_step: usize,
    pub batch_index: usize,
}

/// Extension seams for defenses and instrumentation. Every method defaults to
/// a no-op.
pub trait TrainingHooks {
    /// Extra scalar added to the summed batch loss before backpropagation.
    fn loss_penalty(
        &mut self,
        _model: &dyn TrainableClassifier,
        _inputs: &Tensor,
        _logits: &Tensor,
        _targets: &Tensor,
        _ctx: HookContext,
    ) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Runs after every optimizer step.
    fn post_batch(&mut self, _model: &dyn TrainableClassifier, _ctx: HookContext) -> Result<()> {
        Ok(())
    }

    /// Runs after every completed epoch, once the scheduler has stepped.
    /// `learning_rate` is the rate the next epoch will train with. The epoch
    /// that triggers early stopping gets neither a scheduler step nor this
    /// call.
    fn post_epoch(
        &mut self,
        _model: &dyn TrainableClassifier,
        _epoch: usize,
        _learning_rate: f64,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl TrainingHooks for NoHooks {}
