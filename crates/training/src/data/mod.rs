use std::path::Path;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{Result, TrainingError};

/// Tensor names looked up in dataset files, in order of preference.
const INPUT_KEYS: [&str; 2] = ["inputs", "images"];
const TARGET_KEYS: [&str; 2] = ["targets", "labels"];

/// One group of examples: inputs stacked along dim 0 and their targets.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl DataBatch {
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self> {
        let examples = inputs.dims().first().copied().unwrap_or(0);
        let labels = targets.dims().first().copied().unwrap_or(0);
        if examples != labels {
            return Err(TrainingError::runtime(format!(
                "batch has {} inputs but {} targets",
                examples, labels
            )));
        }
        Ok(Self { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.to_device(device)?,
            targets: self.targets.to_device(device)?,
        })
    }
}

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<DataBatch>> + 'a>;

/// Re-iterable producer of batches. Every call to [`DataSource::batches`]
/// starts a new pass over the data; the final batch may be smaller than the
/// others.
pub trait DataSource {
    fn batches(&mut self) -> Result<BatchIter<'_>>;
}

impl DataSource for Vec<DataBatch> {
    fn batches(&mut self) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}

/// In-memory dataset split into fixed-size batches, optionally reshuffled on
/// every pass.
#[derive(Debug, Clone)]
pub struct TensorDataSource {
    inputs: Tensor,
    targets: Tensor,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    drop_last: bool,
    passes: u64,
}

impl TensorDataSource {
    pub fn new(inputs: Tensor, targets: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::configuration(
                "model.hyper.batch_size",
                "must be greater than 0",
            ));
        }
        let batch = DataBatch::new(inputs, targets)?;
        Ok(Self {
            inputs: batch.inputs,
            targets: batch.targets,
            batch_size,
            shuffle_seed: None,
            drop_last: false,
            passes: 0,
        })
    }

    /// Loads `inputs`/`targets` (or `images`/`labels`) from a safetensors file.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TrainingError::runtime(format!(
                "dataset file not found at {}",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |keys: &[&str]| {
            keys.iter().find_map(|key| tensors.remove(*key)).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "dataset {} has no tensor named {}",
                    path.display(),
                    keys.join(" or ")
                ))
            })
        };
        let inputs = take(&INPUT_KEYS)?;
        let targets = take(&TARGET_KEYS)?;
        Self::new(inputs, targets, batch_size)
    }

    /// Reshuffles example order on every pass; pass `n` uses `seed + n`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn next_order(&mut self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.passes));
            order.shuffle(&mut rng);
        }
        self.passes += 1;
        order
    }
}

impl DataSource for TensorDataSource {
    fn batches(&mut self) -> Result<BatchIter<'_>> {
        let order = self.next_order();
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;
        let groups: Vec<Vec<u32>> = order
            .chunks(batch_size)
            .filter(|group| !drop_last || group.len() == batch_size)
            .map(<[u32]>::to_vec)
            .collect();

        let inputs = &self.inputs;
        let targets = &self.targets;
        Ok(Box::new(groups.into_iter().map(move |group| {
            let len = group.len();
            let index = Tensor::from_vec(group, len, inputs.device())?;
            DataBatch::new(inputs.index_select(&index, 0)?, targets.index_select(&index, 0)?)
        })))
    }
}
