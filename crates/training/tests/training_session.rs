use std::{collections::HashMap, path::Path, sync::Arc};

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, VarBuilder};
use tempfile::tempdir;
use training::{
    Architecture, CheckpointManager, Classifier, DataBatch, DataSource, HookContext, Logger,
    ReplicationPlan, Stage, StageBuilder, StopReason, TrainableClassifier, Trainer,
    TrainingConfig, TrainingError, TrainingHooks, Unwrap,
};

struct TwoLayer {
    inputs: usize,
    hidden: usize,
    classes: usize,
}

impl Architecture for TwoLayer {
    fn name(&self) -> &str {
        "two-layer"
    }

    fn n_classes(&self) -> usize {
        self.classes
    }

    fn feature_extractor(&self) -> StageBuilder {
        let (inputs, hidden) = (self.inputs, self.hidden);
        Arc::new(move |vb: VarBuilder| {
            Ok(Box::new(linear(inputs, hidden, vb.pp("fc1"))?) as Box<dyn Stage>)
        })
    }

    fn classification_layer(&self) -> Option<StageBuilder> {
        let (hidden, classes) = (self.hidden, self.classes);
        Some(Arc::new(move |vb: VarBuilder| {
            Ok(Box::new(linear(hidden, classes, vb)?) as Box<dyn Stage>)
        }))
    }
}

fn classifier(classes: usize) -> Classifier {
    Classifier::new(
        &TwoLayer {
            inputs: 4,
            hidden: 6,
            classes,
        },
        &Device::Cpu,
    )
    .expect("classifier")
}

fn config(save_dir: &Path, classes: usize) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.dataset.n_classes = classes;
    config.dataset.input_size = vec![1, 1, 4];
    config.model.hyper.lr = 1e-2;
    config.model.hyper.epochs = 3;
    config.model.hyper.patience = 2;
    config.training.device = "cpu".into();
    config.training.replicate = false;
    config.training.verbose = 0;
    config.training.save_as = Some("session".into());
    config.training.save_dir = save_dir.to_path_buf();
    config
}

fn batches(sizes: &[usize], label: u32) -> Vec<DataBatch> {
    sizes
        .iter()
        .enumerate()
        .map(|(offset, &size)| {
            let inputs = Tensor::arange(0f32, (size * 4) as f32, &Device::Cpu)
                .and_then(|t| t.affine(0.1, offset as f64))
                .and_then(|t| t.reshape((size, 4)))
                .expect("inputs");
            let targets = Tensor::full(label, size, &Device::Cpu).expect("targets");
            DataBatch::new(inputs, targets).expect("batch")
        })
        .collect()
}

fn zero_batches(count: usize, size: usize, label: u32) -> Vec<DataBatch> {
    (0..count)
        .map(|_| {
            DataBatch::new(
                Tensor::zeros((size, 4), DType::F32, &Device::Cpu).expect("inputs"),
                Tensor::full(label, size, &Device::Cpu).expect("targets"),
            )
            .expect("batch")
        })
        .collect()
}

fn merged(batches: &[DataBatch]) -> Vec<DataBatch> {
    let inputs: Vec<Tensor> = batches.iter().map(|b| b.inputs.clone()).collect();
    let targets: Vec<Tensor> = batches.iter().map(|b| b.targets.clone()).collect();
    vec![DataBatch::new(
        Tensor::cat(&inputs, 0).expect("cat inputs"),
        Tensor::cat(&targets, 0).expect("cat targets"),
    )
    .expect("batch")]
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .and_then(|d| d.abs())
        .and_then(|d| d.flatten_all())
        .and_then(|d| d.max(0))
        .and_then(|d| d.to_vec0::<f32>())
        .expect("difference")
}

#[test]
fn epoch_loss_is_the_mean_over_all_examples() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.hyper.lr = 1e-12;
    let mut trainer = Trainer::new(config, classifier(3))
        .expect("trainer")
        .with_logger(Logger::silent());

    let mut uneven = batches(&[3, 3, 1], 2);
    let mut whole = merged(&uneven);
    let reference = trainer.evaluate(&mut whole).expect("evaluate");
    let epoch_loss = trainer.train_one_epoch(&mut uneven).expect("epoch");

    assert_eq!(reference.examples, 7);
    assert!(
        (epoch_loss - reference.average_loss).abs() < 1e-4,
        "epoch loss {epoch_loss} vs full batch {}",
        reference.average_loss
    );
    assert_eq!(trainer.session().expect("session").global_step, 3);
}

#[test]
fn evaluation_against_own_outputs_has_zero_mse() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.criterion = "mse".into();
    let mut trainer = Trainer::new(config, classifier(3))
        .expect("trainer")
        .with_logger(Logger::silent());

    let inputs = batches(&[5], 0).remove(0).inputs;
    trainer.model_mut().set_training(false);
    let outputs = trainer.model().forward(&inputs).expect("forward");
    trainer.model_mut().set_training(true);

    let mut data = vec![DataBatch::new(inputs, outputs).expect("batch")];
    let summary = trainer.evaluate(&mut data).expect("evaluate");
    assert_eq!(summary.average_loss, 0.0);
    assert_eq!(summary.accuracy, 1.0);
    assert!(trainer.model().is_training());
}

#[test]
fn stops_early_and_restores_the_best_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 2);
    config.model.hyper.epochs = 10;
    config.model.hyper.patience = 1;
    let mut trainer = Trainer::new(config, classifier(2))
        .expect("trainer")
        .with_logger(Logger::silent());

    let mut train = zero_batches(1, 8, 0);
    let mut val = zero_batches(1, 8, 1);
    let report = trainer
        .train_model(&mut train, Some(&mut val as &mut dyn DataSource))
        .expect("training");

    assert_eq!(report.stop_reason, StopReason::EarlyStopped { epoch: 1 });
    assert_eq!(report.epochs_run, 2);
    assert_eq!(report.global_step, 2);
    assert!(report.checkpoint_path.is_file());

    let first = report.history[0].validation.expect("first evaluation");
    let second = report.history[1].validation.expect("second evaluation");
    assert!(second.average_loss > first.average_loss);
    assert_eq!(report.best_val_loss, Some(first.average_loss));

    let restored = trainer.evaluate(&mut val).expect("evaluate");
    assert!((restored.average_loss - first.average_loss).abs() < 1e-6);
}

#[test]
fn constant_model_has_zero_epoch_loss_over_ragged_batches() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.criterion = "mse".into();
    let mut trainer = Trainer::new(config, classifier(3))
        .expect("trainer")
        .with_logger(Logger::silent());

    // Zero inputs make every row of the output equal, so the targets are
    // exactly what the model already predicts.
    let mut data: Vec<DataBatch> = [3, 3, 1]
        .iter()
        .map(|&size| {
            let inputs = Tensor::zeros((size, 4), DType::F32, &Device::Cpu).expect("inputs");
            let targets = trainer.model().forward(&inputs).expect("forward");
            DataBatch::new(inputs, targets).expect("batch")
        })
        .collect();

    let loss = trainer.train_one_epoch(&mut data).expect("epoch");
    assert_eq!(loss, 0.0);
    assert_eq!(trainer.session().expect("session").global_step, 3);
}

#[test]
fn patience_counts_consecutive_non_improving_epochs() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 2);
    config.model.hyper.epochs = 10;
    config.model.hyper.patience = 2;
    let mut trainer = Trainer::new(config, classifier(2))
        .expect("trainer")
        .with_logger(Logger::silent());

    let mut train = zero_batches(1, 8, 0);
    let mut val = zero_batches(1, 8, 1);
    let report = trainer
        .train_model(&mut train, Some(&mut val as &mut dyn DataSource))
        .expect("training");

    assert_eq!(report.stop_reason, StopReason::EarlyStopped { epoch: 2 });
    assert_eq!(report.epochs_run, 3);
    assert_eq!(report.history.len(), 3);
    assert_eq!(report.global_step, 3);
    let first = report.history[0].validation.expect("first evaluation");
    assert_eq!(report.best_val_loss, Some(first.average_loss));
}

#[test]
fn scheduler_steps_before_post_epoch_and_not_on_the_stopping_epoch() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 2);
    config.model.lr_scheduler = Some("MultiStepLR".into());
    config.model.hyper.milestones = vec![1, 2];
    config.model.hyper.gamma = 0.5;
    config.model.hyper.epochs = 10;
    config.model.hyper.patience = 2;
    let mut trainer = Trainer::new(config, classifier(2))
        .expect("trainer")
        .with_logger(Logger::silent())
        .with_hooks(CountingHooks::default());

    let mut train = zero_batches(1, 8, 0);
    let mut val = zero_batches(1, 8, 1);
    let report = trainer
        .train_model(&mut train, Some(&mut val as &mut dyn DataSource))
        .expect("training");
    assert_eq!(report.stop_reason, StopReason::EarlyStopped { epoch: 2 });

    let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
    let seen = &trainer.hooks().learning_rates;
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert_eq!(seen[0].0, 0);
    assert!(close(seen[0].1, 5e-3), "{seen:?}");
    assert_eq!(seen[1].0, 1);
    assert!(close(seen[1].1, 2.5e-3), "{seen:?}");

    let rates: Vec<f64> = report.history.iter().map(|r| r.learning_rate).collect();
    assert!(close(rates[0], 1e-2), "{rates:?}");
    assert!(close(rates[1], 5e-3), "{rates:?}");
    assert!(close(rates[2], 2.5e-3), "{rates:?}");
    let final_rate = trainer.session().expect("session").learning_rate();
    assert!(close(final_rate, 2.5e-3), "{final_rate}");
}

#[test]
fn unsupported_optimizer_fails_before_training() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.optimizer = "sgd".into();
    let err = match Trainer::new(config, classifier(3)) {
        Ok(_) => panic!("sgd must be rejected"),
        Err(err) => err,
    };
    assert!(err.is_configuration());
    assert!(err
        .issues()
        .iter()
        .any(|issue| issue.field == "model.optimizer"));
    assert!(!dir.path().join("session.safetensors").exists());
}

#[derive(Default)]
struct CountingHooks {
    penalties: usize,
    batches: usize,
    epochs: Vec<usize>,
    learning_rates: Vec<(usize, f64)>,
    last_step: usize,
}

impl TrainingHooks for CountingHooks {
    fn loss_penalty(
        &mut self,
        _model: &dyn TrainableClassifier,
        _inputs: &Tensor,
        _logits: &Tensor,
        _targets: &Tensor,
        _ctx: HookContext,
    ) -> training::Result<Option<Tensor>> {
        self.penalties += 1;
        Ok(Some(Tensor::new(0f32, &Device::Cpu)?))
    }

    fn post_batch(
        &mut self,
        _model: &dyn TrainableClassifier,
        ctx: HookContext,
    ) -> training::Result<()> {
        self.batches += 1;
        self.last_step = ctx.global_step;
        Ok(())
    }

    fn post_epoch(
        &mut self,
        _model: &dyn TrainableClassifier,
        epoch: usize,
        learning_rate: f64,
    ) -> training::Result<()> {
        self.epochs.push(epoch);
        self.learning_rates.push((epoch, learning_rate));
        Ok(())
    }
}

#[test]
fn hooks_fire_once_per_batch_and_epoch() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.hyper.epochs = 2;
    let mut trainer = Trainer::new(config, classifier(3))
        .expect("trainer")
        .with_logger(Logger::silent())
        .with_hooks(CountingHooks::default());

    let mut train = batches(&[2, 2, 2], 1);
    let report = trainer.train_model(&mut train, None).expect("training");

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.best_val_loss, None);
    assert!(report.checkpoint_path.is_file());
    let hooks = trainer.hooks();
    assert_eq!(hooks.penalties, 6);
    assert_eq!(hooks.batches, 6);
    assert_eq!(hooks.last_step, 6);
    assert_eq!(hooks.epochs, vec![0, 1]);
}

fn legacy_checkpoint(path: &Path, head_width: usize) {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "model.fc1.weight".to_string(),
        Tensor::ones((6, 4), DType::F32, &device).expect("weight"),
    );
    tensors.insert(
        "model.fc1.bias".to_string(),
        Tensor::zeros(6, DType::F32, &device).expect("bias"),
    );
    tensors.insert(
        "model.fc.weight".to_string(),
        Tensor::arange(0f32, (head_width * 6) as f32, &device)
            .and_then(|t| t.reshape((head_width, 6)))
            .expect("head weight"),
    );
    tensors.insert(
        "model.fc.bias".to_string(),
        Tensor::arange(0f32, head_width as f32, &device).expect("head bias"),
    );
    candle_core::safetensors::save(&tensors, path).expect("write legacy checkpoint");
}

#[test]
fn legacy_checkpoint_migrates_and_truncates() {
    let dir = tempdir().expect("tempdir");
    let legacy = dir.path().join("legacy.safetensors");
    legacy_checkpoint(&legacy, 5);

    let model = classifier(3);
    CheckpointManager::load_into(&legacy, &model).expect("load legacy");
    let head = model.classification_layer().unwrapped().data().lock().expect("lock")["bias"]
        .as_tensor()
        .to_vec1::<f32>()
        .expect("bias");
    assert_eq!(head, vec![0.0, 1.0, 2.0]);

    let manager = CheckpointManager::new(dir.path());
    let saved = manager.save_model("migrated", &model).expect("save");
    assert_eq!(saved.manifest.head_width, Some(3));

    let first = CheckpointManager::load(&saved.path, &Device::Cpu, 3).expect("reload");
    let second = CheckpointManager::load(&saved.path, &Device::Cpu, 3).expect("reload again");
    for (name, tensor) in first.flatten() {
        let other = &second.flatten()[&name];
        assert_eq!(max_abs_diff(&tensor, other), 0.0, "{name}");
    }

    let narrower = CheckpointManager::load(&legacy, &Device::Cpu, 5).expect("exact width");
    assert_eq!(narrower.head_width(), Some(5));
    match CheckpointManager::load(&legacy, &Device::Cpu, 6) {
        Err(TrainingError::IncompatibleCheckpoint(message)) => {
            assert!(message.contains("5 outputs but 6 classes"), "{message}")
        }
        other => panic!("expected an incompatible checkpoint, got {other:?}"),
    }
}

#[test]
fn replicated_model_matches_single_device_model() {
    let dir = tempdir().expect("tempdir");
    let single = classifier(3);
    let manager = CheckpointManager::new(dir.path());
    let saved = manager.save_model("single", &single).expect("save");

    let mut replicated = classifier(3);
    CheckpointManager::load_into(&saved.path, &replicated).expect("load");
    ReplicationPlan::from_devices(vec![Device::Cpu, Device::Cpu])
        .expect("plan")
        .apply(replicated.components_mut());
    assert!(replicated.feature_extractor().is_replicated());

    let inputs = batches(&[5], 0).remove(0).inputs;
    let expected = single.forward(&inputs).expect("single forward");
    let actual = replicated.forward(&inputs).expect("replicated forward");
    assert_eq!(actual.dims(), expected.dims());
    assert!(max_abs_diff(&actual, &expected) < 1e-6);

    let copy = manager.save_model("replicated", &replicated).expect("save replicated");
    let mut keys_single: Vec<String> = candle_core::safetensors::load(&saved.path, &Device::Cpu)
        .expect("read")
        .into_keys()
        .collect();
    let mut keys_replicated: Vec<String> = candle_core::safetensors::load(&copy.path, &Device::Cpu)
        .expect("read")
        .into_keys()
        .collect();
    keys_single.sort();
    keys_replicated.sort();
    assert_eq!(keys_single, keys_replicated);
}

#[test]
fn replicated_training_session_runs() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), 3);
    config.model.hyper.epochs = 1;
    let mut trainer = Trainer::new(config, classifier(3))
        .expect("trainer")
        .with_logger(Logger::silent())
        .with_replication(
            ReplicationPlan::from_devices(vec![Device::Cpu, Device::Cpu]).expect("plan"),
        );

    let mut train = batches(&[4, 4], 1);
    let mut val = batches(&[3], 1);
    let report = trainer
        .train_model(&mut train, Some(&mut val as &mut dyn DataSource))
        .expect("training");
    assert_eq!(report.epochs_run, 1);
    assert!(trainer.model().classification_layer().is_replicated());
}
