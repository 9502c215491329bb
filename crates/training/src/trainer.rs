use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use log::{debug, info, warn};

use crate::{
    checkpoint::CheckpointManager,
    config::TrainingConfig,
    data::DataSource,
    device::describe,
    early_stopping::{EarlyStopping, Verdict},
    error::{Result, TrainingError},
    hooks::{HookContext, NoHooks, TrainingHooks},
    logging::{Logger, LoggingSettings},
    loss::{criterion_pair, Criterion},
    metrics::{count_correct, EpochRecord, EvaluationMetrics, EvaluationSummary},
    model::TrainableClassifier,
    optimizer::{AdamConfig, OptimizerKind, TrainerOptimizer},
    replication::ReplicationPlan,
    scheduler::{LRScheduler, SchedulerConfig, SchedulerKind},
};

/// Where the orchestrator is in its epoch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Training,
    Evaluating,
    Improved,
    NotImproved,
    EarlyStopped,
    Completed,
    FinalLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All configured epochs ran.
    Completed,
    /// Patience ran out at this zero-based epoch.
    EarlyStopped { epoch: usize },
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub stop_reason: StopReason,
    pub epochs_run: usize,
    pub global_step: usize,
    /// Lowest validation loss seen, `None` when no evaluation ran.
    pub best_val_loss: Option<f64>,
    /// Checkpoint reloaded into the model at the end of the session.
    pub checkpoint_path: PathBuf,
    pub history: Vec<EpochRecord>,
}

/// Mutable state of one `train_model` call.
pub struct SessionState {
    pub epoch: usize,
    pub global_step: usize,
    early_stopping: EarlyStopping,
    optimizer: TrainerOptimizer,
    scheduler: Option<Box<dyn LRScheduler>>,
}

impl SessionState {
    pub fn best_val_loss(&self) -> f64 {
        self.early_stopping.best()
    }

    pub fn stale_evaluations(&self) -> usize {
        self.early_stopping.stale_evaluations()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

pub struct Trainer<M: TrainableClassifier, H: TrainingHooks = NoHooks> {
    config: TrainingConfig,
    model: M,
    hooks: H,
    mean_criterion: Criterion,
    criterion: Criterion,
    optimizer_kind: OptimizerKind,
    scheduler_kind: Option<SchedulerKind>,
    save_name: String,
    checkpoints: CheckpointManager,
    replication: ReplicationPlan,
    logger: Logger,
    session: Option<SessionState>,
    phase: Phase,
}

impl<M: TrainableClassifier> Trainer<M, NoHooks> {
    /// Validates the configuration and resolves every named choice up front,
    /// so an unusable setup fails before any epoch runs.
    pub fn new(config: TrainingConfig, model: M) -> Result<Self> {
        config.validate()?;

        let (mean_criterion, criterion) = criterion_pair(config.criterion_kind()?);
        let optimizer_kind = config.optimizer_kind()?;
        let scheduler_kind = config.scheduler_kind()?;
        let save_name = config.resolve_save_name()?;

        if model.n_classes() != config.dataset.n_classes {
            warn!(
                "model emits {} classes but dataset.n_classes is {}",
                model.n_classes(),
                config.dataset.n_classes
            );
        }

        let logger = Logger::new(LoggingSettings::from_config(&config, &save_name));
        let replication = if config.training.replicate {
            ReplicationPlan::detect(model.device())
        } else {
            ReplicationPlan::single(model.device())
        };
        let checkpoints = CheckpointManager::new(config.training.save_dir.clone());

        Ok(Self {
            config,
            model,
            hooks: NoHooks,
            mean_criterion,
            criterion,
            optimizer_kind,
            scheduler_kind,
            save_name,
            checkpoints,
            replication,
            logger,
            session: None,
            phase: Phase::Initializing,
        })
    }
}

impl<M: TrainableClassifier, H: TrainingHooks> Trainer<M, H> {
    pub fn with_hooks<H2: TrainingHooks>(self, hooks: H2) -> Trainer<M, H2> {
        Trainer {
            config: self.config,
            model: self.model,
            hooks,
            mean_criterion: self.mean_criterion,
            criterion: self.criterion,
            optimizer_kind: self.optimizer_kind,
            scheduler_kind: self.scheduler_kind,
            save_name: self.save_name,
            checkpoints: self.checkpoints,
            replication: self.replication,
            logger: self.logger,
            session: self.session,
            phase: self.phase,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_replication(mut self, plan: ReplicationPlan) -> Self {
        self.replication = plan;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn save_name(&self) -> &str {
        &self.save_name
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoints.path_for(&self.save_name)
    }

    /// Mean-reduced criterion, for callers that report per-batch averages.
    pub fn mean_criterion(&self) -> Criterion {
        self.mean_criterion
    }

    /// One pass over `data` with an optimizer step per batch. Returns the
    /// summed loss divided by the number of examples seen.
    pub fn train_one_epoch(&mut self, data: &mut dyn DataSource) -> Result<f64> {
        if self.session.is_none() {
            self.session = Some(self.new_session()?);
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TrainingError::runtime("training session was not initialized"))?;

        self.model.set_training(true);
        let device = self.model.device().clone();
        let mut total_loss = 0f64;
        let mut total_examples = 0usize;

        for (batch_index, batch) in data.batches()?.enumerate() {
            let batch = batch?.to_device(&device)?;
            if batch.is_empty() {
                continue;
            }

            let logits = self.model.forward(&batch.inputs)?;
            let mut loss = self.criterion.compute(&logits, &batch.targets)?;
            let ctx = HookContext {
                epoch: session.epoch,
                global_step: session.global_step,
                batch_index,
            };
            if let Some(penalty) = self.hooks.loss_penalty(
                &self.model,
                &batch.inputs,
                &logits,
                &batch.targets,
                ctx,
            )? {
                loss = loss.broadcast_add(&penalty.to_dtype(loss.dtype())?)?;
            }

            let loss_value = loss.to_dtype(DType::F64)?.to_vec0::<f64>()?;
            total_loss += loss_value;
            total_examples += batch.len();

            let mut grads = loss.backward()?;
            session.optimizer.step(&mut grads)?;
            session.global_step += 1;

            self.logger.batch_loss(session.global_step, loss_value);
            self.hooks.post_batch(
                &self.model,
                HookContext {
                    global_step: session.global_step,
                    ..ctx
                },
            )?;
        }

        if total_examples == 0 {
            return Err(TrainingError::runtime(
                "training data source produced no examples",
            ));
        }
        Ok(total_loss / total_examples as f64)
    }

    /// Loss and accuracy over `data` in evaluation mode. Parameters are not
    /// touched and the previous training/evaluation mode is restored.
    pub fn evaluate(&mut self, data: &mut dyn DataSource) -> Result<EvaluationSummary> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let result = self.evaluate_internal(data);
        self.model.set_training(was_training);
        result
    }

    fn evaluate_internal(&self, data: &mut dyn DataSource) -> Result<EvaluationSummary> {
        let device = self.model.device();
        let mut metrics = EvaluationMetrics::default();
        for batch in data.batches()? {
            let batch = batch?.to_device(device)?;
            if batch.is_empty() {
                continue;
            }
            let logits = self.evaluation_logits(&batch.inputs)?;
            let loss = self
                .criterion
                .compute(&logits, &batch.targets)?
                .to_dtype(DType::F64)?
                .to_vec0::<f64>()?;
            let correct = count_correct(&logits, &batch.targets)?;
            metrics.update(loss, batch.len() as u64, correct);
        }
        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no examples"))
    }

    /// Forward pass whose result carries no autograd history.
    pub(crate) fn evaluation_logits(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(inputs)?.detach())
    }

    /// Runs the full epoch loop with periodic validation, early stopping and
    /// best-checkpoint tracking, then reloads the best checkpoint.
    pub fn train_model(
        &mut self,
        train: &mut dyn DataSource,
        mut validation: Option<&mut dyn DataSource>,
    ) -> Result<TrainingReport> {
        self.enter(Phase::Initializing);
        self.session = Some(self.new_session()?);
        self.replication.apply(self.model.components_mut());

        let epochs = self.config.model.hyper.epochs;
        let evaluate_freq = self.config.training.evaluate_freq;
        let checkpoint_path = self.checkpoint_path();
        info!(
            "training {} epoch(s) on {}, best checkpoint at {}",
            epochs,
            describe(self.model.device()),
            checkpoint_path.display()
        );
        self.logger
            .session_started(epochs, &describe(self.model.device()));

        let mut history = Vec::with_capacity(epochs);
        let mut stop_reason = StopReason::Completed;
        let mut saved = false;

        for epoch in 0..epochs {
            self.session_mut()?.epoch = epoch;
            self.enter(Phase::Training);
            let train_loss = self.train_one_epoch(train)?;

            let (global_step, learning_rate, scheduled) = {
                let session = self.session_mut()?;
                (
                    session.global_step,
                    session.optimizer.learning_rate(),
                    session.scheduler.is_some(),
                )
            };
            self.logger.epoch_finished(
                epoch,
                global_step,
                train_loss,
                scheduled.then_some(learning_rate),
            );

            let mut record = EpochRecord {
                epoch,
                train_loss,
                learning_rate,
                validation: None,
                train_evaluation: None,
            };

            if let Some(val_source) = validation.as_deref_mut() {
                if epoch % evaluate_freq == 0 {
                    self.enter(Phase::Evaluating);
                    let val_summary = self.evaluate(val_source)?;
                    let train_summary = self.evaluate(train)?;
                    self.logger
                        .evaluation(epoch, global_step, &val_summary, &train_summary);
                    record.validation = Some(val_summary);
                    record.train_evaluation = Some(train_summary);

                    let verdict = self
                        .session_mut()?
                        .early_stopping
                        .observe(val_summary.average_loss);
                    match verdict {
                        Verdict::Improved => {
                            self.enter(Phase::Improved);
                            let checkpoint =
                                self.checkpoints.save_model(&self.save_name, &self.model)?;
                            self.logger
                                .checkpoint_saved(&checkpoint.path, val_summary.average_loss);
                            saved = true;
                        }
                        Verdict::NotImproved => self.enter(Phase::NotImproved),
                        Verdict::Stop => {
                            self.enter(Phase::EarlyStopped);
                            self.logger.early_stop(epoch);
                            history.push(record);
                            stop_reason = StopReason::EarlyStopped { epoch };
                            break;
                        }
                    }
                }
            }
            history.push(record);

            let session = self.session_mut()?;
            if let Some(scheduler) = session.scheduler.as_mut() {
                let lr = scheduler.step();
                session.optimizer.set_learning_rate(lr);
            }
            let next_learning_rate = session.optimizer.learning_rate();
            self.hooks
                .post_epoch(&self.model, epoch, next_learning_rate)?;
        }

        if stop_reason == StopReason::Completed {
            self.enter(Phase::Completed);
        }
        self.logger.session_finished();

        self.enter(Phase::FinalLoad);
        if !saved {
            debug!("no checkpoint saved during the session; persisting final weights");
            self.checkpoints.save_model(&self.save_name, &self.model)?;
        }
        CheckpointManager::load_into(&checkpoint_path, &self.model)?;

        let session = self.session_mut()?;
        let best = session.early_stopping.best();
        Ok(TrainingReport {
            stop_reason,
            epochs_run: history.len(),
            global_step: session.global_step,
            best_val_loss: best.is_finite().then_some(best),
            checkpoint_path,
            history,
        })
    }

    /// Restores weights from an arbitrary checkpoint file into the model.
    pub fn load_checkpoint(&self, path: &Path) -> Result<()> {
        CheckpointManager::load_into(path, &self.model)
    }

    fn new_session(&self) -> Result<SessionState> {
        let hyper = &self.config.model.hyper;
        let optimizer = match self.optimizer_kind {
            OptimizerKind::Adam => TrainerOptimizer::new(
                self.model.parameters()?,
                AdamConfig::new(hyper.lr, hyper.beta2),
            )?,
        };
        let scheduler = self
            .scheduler_kind
            .map(|kind| SchedulerConfig::from_training_config(kind, hyper).map(SchedulerConfig::build))
            .transpose()?;
        Ok(SessionState {
            epoch: 0,
            global_step: 0,
            early_stopping: EarlyStopping::new(hyper.patience),
            optimizer,
            scheduler,
        })
    }

    fn session_mut(&mut self) -> Result<&mut SessionState> {
        self.session
            .as_mut()
            .ok_or_else(|| TrainingError::runtime("training session was not initialized"))
    }

    fn enter(&mut self, phase: Phase) {
        debug!("trainer phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}
