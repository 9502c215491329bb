use std::path::PathBuf;

use candle_core::Device;
use classifiers::{
    get_model,
    overrides::{apply_overrides, ConfigOverride},
};
use clap::Parser;
use training::{DataSource, TensorDataSource, Trainer, TrainingConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Image classifier training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (.toml or .json)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let device = config.device_spec()?.resolve()?;
    let model = get_model(&config, &device)?;

    let batch_size = config.model.hyper.batch_size;
    let train_path = config.dataset.train_path.clone().ok_or_else(|| {
        TrainingError::configuration("dataset.train_path", "a training set is required")
    })?;
    let mut train = TensorDataSource::from_safetensors(&train_path, batch_size, &Device::Cpu)?
        .with_drop_last(config.training.drop_last);
    if config.training.shuffle {
        train = train.with_shuffle(config.training.seed);
    }
    let mut validation = config
        .dataset
        .val_path
        .as_ref()
        .map(|path| TensorDataSource::from_safetensors(path, batch_size, &Device::Cpu))
        .transpose()?;
    let test = config
        .dataset
        .test_path
        .as_ref()
        .map(|path| TensorDataSource::from_safetensors(path, batch_size, &Device::Cpu))
        .transpose()?;

    println!(
        "dataset {}: {} training examples{}",
        config.dataset.dataset,
        train.len(),
        validation
            .as_ref()
            .map(|val| format!(", {} validation examples", val.len()))
            .unwrap_or_default()
    );

    let mut trainer = Trainer::new(config, model)?;
    let report = trainer.train_model(
        &mut train,
        validation.as_mut().map(|val| val as &mut dyn DataSource),
    )?;

    println!(
        "finished after {} epoch(s), {} optimizer steps ({:?})",
        report.epochs_run, report.global_step, report.stop_reason
    );
    if let Some(best) = report.best_val_loss {
        println!("best validation loss: {:.6}", best);
    }
    println!("model weights: {}", report.checkpoint_path.display());

    if let Some(mut test) = test {
        let summary = trainer.evaluate(&mut test)?;
        println!(
            "test loss: {:.6}, test accuracy: {:.4} over {} examples",
            summary.average_loss, summary.accuracy, summary.examples
        );
    }

    Ok(())
}
