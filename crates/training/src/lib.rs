pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod early_stopping;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod replication;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointManifest, CheckpointState, SavedCheckpoint};
pub use config::{DatasetConfig, HyperParameters, ModelConfig, RuntimeConfig, TrainingConfig};
pub use data::{DataBatch, DataSource, TensorDataSource};
pub use device::DeviceSpec;
pub use early_stopping::{EarlyStopping, Verdict};
pub use error::{ConfigIssue, Result, TrainingError};
pub use hooks::{HookContext, NoHooks, TrainingHooks};
pub use logging::{Logger, LoggingSettings, TensorBoardSink, TrackingSink};
pub use loss::{select_criterion, Criterion, CriterionKind, Reduction};
pub use metrics::{EpochRecord, EvaluationSummary};
pub use model::{Architecture, Classifier, Stage, StageBuilder, TrainableClassifier};
pub use optimizer::{AdamConfig, OptimizerKind, TrainerOptimizer};
pub use replication::{Component, ReplicationPlan, Unwrap};
pub use scheduler::{LRScheduler, MultiStepDecay, SchedulerConfig, SchedulerKind};
pub use trainer::{Phase, StopReason, Trainer, TrainingReport};
