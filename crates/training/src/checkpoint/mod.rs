pub mod migration;

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use migration::{CheckpointState, TensorMap};

use crate::{
    error::{Result, TrainingError},
    model::TrainableClassifier,
    replication::{lock_vars, Unwrap},
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
const MANIFEST_EXTENSION: &str = "json";
const SPLIT_LAYOUT: &str = "split";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Sidecar written next to every tensor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub layout: String,
    pub tensors: FileRecord,
    pub parameters: usize,
    pub head_width: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub path: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Persists and restores model components under a single directory. Holds
/// no state beyond that directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
}

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<directory>/<name>.safetensors`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let stem = name
            .strip_suffix(&format!(".{CHECKPOINT_EXTENSION}"))
            .unwrap_or(name);
        self.directory.join(format!("{stem}.{CHECKPOINT_EXTENSION}"))
    }

    pub fn manifest_path(tensor_path: &Path) -> PathBuf {
        tensor_path.with_extension(MANIFEST_EXTENSION)
    }

    /// Writes the canonical parameters of both components. Each file is
    /// written beside its destination and renamed into place.
    pub fn save(
        &self,
        name: &str,
        feature_extractor: &dyn Unwrap,
        classification_layer: &dyn Unwrap,
    ) -> Result<SavedCheckpoint> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let state = CheckpointState {
            feature_extractor: snapshot(feature_extractor)?,
            classification_layer: snapshot(classification_layer)?,
        };
        let parameters = state.feature_extractor.len() + state.classification_layer.len();
        if parameters == 0 {
            return Err(TrainingError::runtime(
                "model contains no parameters to checkpoint",
            ));
        }

        let path = self.path_for(name);
        let staging = staging_path(&path);
        candle_core::safetensors::save(&state.flatten(), &staging).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                staging.display()
            ))
        })?;

        let mut tensors = file_record(&staging)?;
        tensors.filename = file_name(&path)?;
        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            layout: SPLIT_LAYOUT.to_string(),
            tensors,
            parameters,
            head_width: state.head_width(),
        };
        let manifest_path = Self::manifest_path(&path);
        let manifest_staging = staging_path(&manifest_path);
        write_json(&manifest_staging, &manifest)?;

        commit(&staging, &path)?;
        commit(&manifest_staging, &manifest_path)?;
        debug!(
            "checkpoint saved to {} ({} tensors, sha256={})",
            path.display(),
            parameters,
            manifest.tensors.sha256
        );

        Ok(SavedCheckpoint { path, manifest })
    }

    pub fn save_model<M: TrainableClassifier + ?Sized>(
        &self,
        name: &str,
        model: &M,
    ) -> Result<SavedCheckpoint> {
        self.save(
            name,
            model.feature_extractor(),
            model.classification_layer(),
        )
    }

    /// Reads a checkpoint, migrates legacy layouts and narrows the head to
    /// `n_classes`. Nothing is written into any model.
    pub fn load(path: &Path, device: &Device, n_classes: usize) -> Result<CheckpointState> {
        if !path.is_file() {
            return Err(TrainingError::CheckpointNotFound {
                path: path.to_path_buf(),
            });
        }

        let manifest_path = Self::manifest_path(path);
        if manifest_path.is_file() {
            let manifest: CheckpointManifest = read_json(&manifest_path)?;
            ensure_version_supported(manifest.version)?;
            validate_file(path, &manifest.tensors.sha256)?;
        } else {
            debug!(
                "no manifest next to {}; treating it as an unversioned checkpoint",
                path.display()
            );
        }

        let raw = load_safetensors(path, device).map_err(|err| {
            TrainingError::incompatible(format!(
                "failed to read tensors from {}: {err}",
                path.display()
            ))
        })?;
        let sections = migration::split_sections(raw)?;
        let state = migration::upgrade(sections)?;
        migration::reconcile_head(state, n_classes)
    }

    /// Writes `state` into the canonical parameters of both components. Every
    /// parameter is checked before the first one is overwritten, so a
    /// mismatch leaves the components untouched.
    pub fn apply(
        state: CheckpointState,
        feature_extractor: &dyn Unwrap,
        classification_layer: &dyn Unwrap,
    ) -> Result<()> {
        let [(extractor_name, extractor_state), (head_name, head_state)] = state.into_sections();
        let mut staged = stage_section(extractor_name, extractor_state, feature_extractor)?;
        staged.extend(stage_section(head_name, head_state, classification_layer)?);

        for (var, tensor) in staged {
            let tensor = tensor
                .to_dtype(var.as_tensor().dtype())?
                .to_device(var.as_tensor().device())?;
            var.set(&tensor)?;
        }
        Ok(())
    }

    pub fn load_into<M: TrainableClassifier + ?Sized>(path: &Path, model: &M) -> Result<()> {
        let state = Self::load(path, model.device(), model.n_classes())?;
        Self::apply(
            state,
            model.feature_extractor(),
            model.classification_layer(),
        )?;
        info!("restored model weights from {}", path.display());
        Ok(())
    }
}

fn snapshot(component: &dyn Unwrap) -> Result<TensorMap> {
    let vars = lock_vars(component.unwrapped())?;
    let mut tensors = HashMap::with_capacity(vars.len());
    for (name, var) in vars.iter() {
        tensors.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
    }
    Ok(tensors)
}

fn stage_section(
    section: &str,
    mut tensors: TensorMap,
    component: &dyn Unwrap,
) -> Result<Vec<(Var, Tensor)>> {
    let vars = lock_vars(component.unwrapped())?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut staged = Vec::with_capacity(names.len());
    for name in names {
        let var = &vars[name];
        let tensor = tensors.remove(name.as_str()).ok_or_else(|| {
            TrainingError::incompatible(format!("checkpoint missing parameter {section}.{name}"))
        })?;
        let expected = var.as_tensor().dims();
        if tensor.dims() != expected {
            return Err(TrainingError::incompatible(format!(
                "parameter {section}.{name} expected shape {:?}, found {:?}",
                expected,
                tensor.dims()
            )));
        }
        staged.push((var.clone(), tensor));
    }

    if !tensors.is_empty() {
        let mut extra: Vec<String> = tensors
            .into_keys()
            .map(|name| format!("{section}.{name}"))
            .collect();
        extra.sort();
        return Err(TrainingError::incompatible(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(staged)
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn commit(staging: &Path, destination: &Path) -> Result<()> {
    fs::rename(staging, destination).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} into place at {}: {err}",
            staging.display(),
            destination.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    Ok(FileRecord {
        filename: file_name(path)?,
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<()> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::incompatible(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::incompatible(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::incompatible(format!(
            "failed to parse manifest {}: {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::tiny;

    fn weights(model: &dyn TrainableClassifier) -> Vec<(String, Vec<f32>)> {
        model
            .parameters()
            .unwrap()
            .into_iter()
            .map(|(name, var)| {
                let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
                (name, values)
            })
            .collect()
    }

    #[test]
    fn save_then_load_restores_parameters() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::new(dir.path());
        let source = tiny(3, 4, 2)?;
        let target = tiny(3, 4, 2)?;

        let saved = manager.save_model("unit", &source)?;
        assert_eq!(saved.path, dir.path().join("unit.safetensors"));
        assert!(CheckpointManager::manifest_path(&saved.path).is_file());
        assert_eq!(saved.manifest.head_width, Some(2));

        CheckpointManager::load_into(&saved.path, &target)?;
        assert_eq!(weights(&source), weights(&target));
        Ok(())
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.safetensors");
        let err = CheckpointManager::load(&path, &Device::Cpu, 2).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointNotFound { path: p } if p == path));
    }

    #[test]
    fn corrupted_tensor_file_fails_checksum() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::new(dir.path());
        let saved = manager.save_model("unit", &tiny(3, 4, 2)?)?;
        let mut bytes = fs::read(&saved.path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&saved.path, bytes)?;

        let err = CheckpointManager::load(&saved.path, &Device::Cpu, 2).unwrap_err();
        assert!(matches!(err, TrainingError::IncompatibleCheckpoint(_)));
        Ok(())
    }

    #[test]
    fn shape_mismatch_leaves_model_untouched() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::new(dir.path());
        let saved = manager.save_model("wide", &tiny(3, 6, 2)?)?;

        let target = tiny(3, 4, 2)?;
        let before = weights(&target);
        let err = CheckpointManager::load_into(&saved.path, &target).unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("feature_extractor.fc1.bias expected shape [4], found [6]"),
            "{message}"
        );
        assert_eq!(before, weights(&target));
        Ok(())
    }

    #[test]
    fn checkpoint_names_with_extension_are_not_doubled() {
        let manager = CheckpointManager::new("/tmp/models");
        assert_eq!(
            manager.path_for("best.safetensors"),
            PathBuf::from("/tmp/models/best.safetensors")
        );
        assert_eq!(manager.path_for("best"), PathBuf::from("/tmp/models/best.safetensors"));
    }

    #[test]
    fn staging_files_do_not_survive_a_save() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        CheckpointManager::new(dir.path()).save_model("unit", &tiny(2, 2, 2)?)?;
        let mut names: Vec<String> = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        assert_eq!(names, vec!["unit.json", "unit.safetensors"]);
        Ok(())
    }
}
