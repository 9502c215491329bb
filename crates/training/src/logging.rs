use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use indicatif::{ProgressBar, ProgressStyle};
use prost::Message;

use crate::{
    config::TrainingConfig,
    error::{Result, TrainingError},
    metrics::EvaluationSummary,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    /// 0 silent, 1 per-epoch summaries, 2 also every batch loss.
    pub verbosity: u8,
    pub tracking_dir: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &TrainingConfig, run_name: &str) -> Self {
        let tracking = &config.training.tracking;
        let tracking_dir = tracking.track.then(|| {
            tracking
                .directory
                .clone()
                .unwrap_or_else(|| config.training.save_dir.join("runs"))
                .join(run_name)
        });
        Self {
            verbosity: config.training.verbose,
            tracking_dir,
            flush_every_n: tracking.flush_every_n.max(1),
        }
    }

    pub fn silent() -> Self {
        Self {
            verbosity: 0,
            tracking_dir: None,
            flush_every_n: 1,
        }
    }
}

/// Destination for experiment-tracking records. Failures are reported to the
/// caller, which is free to ignore them.
pub trait TrackingSink {
    fn record(&mut self, key: &str, value: f64, global_step: usize, epoch: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct Logger {
    verbosity: u8,
    sink: Option<Box<dyn TrackingSink>>,
    progress: Option<ProgressBar>,
}

impl Logger {
    /// A tracking directory that cannot be opened disables tracking for the
    /// session instead of failing it.
    pub fn new(settings: LoggingSettings) -> Self {
        let sink = settings.tracking_dir.as_ref().and_then(|dir| {
            match TensorBoardSink::create(dir, settings.flush_every_n) {
                Ok(sink) => Some(Box::new(sink) as Box<dyn TrackingSink>),
                Err(err) => {
                    log::warn!("experiment tracking disabled: {err}");
                    None
                }
            }
        });
        Self {
            verbosity: settings.verbosity,
            sink,
            progress: None,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.sink.is_some()
    }

    pub fn silent() -> Self {
        Self {
            verbosity: 0,
            sink: None,
            progress: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn TrackingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn session_started(&mut self, epochs: usize, device: &str) {
        if self.verbosity == 0 {
            return;
        }
        println!("\ntraining on {device}");
        let bar = ProgressBar::new(epochs as u64);
        let style = ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {pos}/{len} epochs ({elapsed_precise})",
        )
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message("Training");
        self.progress = Some(bar);
    }

    pub fn batch_loss(&mut self, global_step: usize, loss: f64) {
        if self.verbosity >= 2 {
            self.say(&format!("step {global_step} loss: {loss:.6}"));
        }
    }

    pub fn epoch_finished(
        &mut self,
        epoch: usize,
        global_step: usize,
        train_loss: f64,
        learning_rate: Option<f64>,
    ) {
        if self.verbosity >= 1 {
            self.say(&format!("epoch: {}", epoch + 1));
            self.say(&format!("train loss: {train_loss:.6}"));
        }
        self.track("train_loss", train_loss, global_step, epoch);
        self.track("epoch", (epoch + 1) as f64, global_step, epoch);
        if let Some(lr) = learning_rate {
            self.track("learning_rate", lr, global_step, epoch);
        }
        if let Some(bar) = self.progress.as_ref() {
            bar.inc(1);
        }
    }

    pub fn evaluation(
        &mut self,
        epoch: usize,
        global_step: usize,
        validation: &EvaluationSummary,
        train: &EvaluationSummary,
    ) {
        if self.verbosity >= 1 {
            self.say(&format!("train accuracy: {:.4}", train.accuracy));
            self.say(&format!("validation loss: {:.6}", validation.average_loss));
            self.say(&format!("validation accuracy: {:.4}", validation.accuracy));
        }
        self.track("train_accuracy", train.accuracy, global_step, epoch);
        self.track("val_loss", validation.average_loss, global_step, epoch);
        self.track("val_accuracy", validation.accuracy, global_step, epoch);
    }

    pub fn checkpoint_saved(&mut self, path: &Path, val_loss: f64) {
        log::info!(
            "new best checkpoint saved at {} (val_loss={:.6})",
            path.display(),
            val_loss
        );
    }

    pub fn early_stop(&mut self, epoch: usize) {
        if self.verbosity >= 1 {
            self.say(&format!("early stopping after epoch {}", epoch + 1));
        }
    }

    pub fn session_finished(&mut self) {
        if let Some(bar) = self.progress.take() {
            bar.finish_with_message("Training done");
        }
        self.flush();
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                log::warn!("tracking sink flush failed: {err}");
            }
        }
    }

    fn say(&self, message: &str) {
        match self.progress.as_ref() {
            Some(bar) => bar.println(message),
            None => println!("{message}"),
        }
    }

    fn track(&mut self, key: &str, value: f64, global_step: usize, epoch: usize) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.record(key, value, global_step, epoch) {
                log::debug!("dropping tracking record {key}: {err}");
            }
        }
    }
}

/// Writes scalars as TensorBoard event files (`events.out.tfevents.*`).
pub struct TensorBoardSink {
    writer: BufWriter<File>,
    path: PathBuf,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardSink {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut sink = Self {
            writer: BufWriter::new(file),
            path,
            flush_every: flush_every.max(1),
            pending: 0,
        };
        sink.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            TrackingSink::flush(self)?;
        }
        Ok(())
    }
}

impl TrackingSink for TensorBoardSink {
    fn record(&mut self, key: &str, value: f64, global_step: usize, _epoch: usize) -> Result<()> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: key.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step: global_step as i64,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardSink {
    fn drop(&mut self) {
        let _ = TrackingSink::flush(self);
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
