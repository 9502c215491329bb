//! Pure transforms from on-disk tensor maps to a [`CheckpointState`].
//!
//! Layouts understood here:
//! * split (current): `feature_extractor.<param>` and `classification_layer.<param>`;
//!   the head section is absent for architectures without a separate head.
//! * legacy: a single `model.<param>` section whose `fc.weight`/`fc.bias`
//!   entries are the classification head.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use crate::{
    error::{Result, TrainingError},
    model::{CLASSIFICATION_LAYER, FEATURE_EXTRACTOR},
};

pub type TensorMap = HashMap<String, Tensor>;

pub const LEGACY_SECTION: &str = "model";
const LEGACY_HEAD_WEIGHT: &str = "fc.weight";
const LEGACY_HEAD_BIAS: &str = "fc.bias";

/// Parameters of both model components, keyed by in-component name.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    pub feature_extractor: TensorMap,
    pub classification_layer: TensorMap,
}

impl CheckpointState {
    /// Output width of the dense classification head, if there is one.
    pub fn head_width(&self) -> Option<usize> {
        self.classification_layer
            .get("weight")
            .and_then(|weight| weight.dims().first().copied())
    }

    pub fn into_sections(self) -> [(&'static str, TensorMap); 2] {
        [
            (FEATURE_EXTRACTOR, self.feature_extractor),
            (CLASSIFICATION_LAYER, self.classification_layer),
        ]
    }

    /// Flat `<section>.<param>` naming used in tensor files.
    pub fn flatten(&self) -> TensorMap {
        let mut flat = HashMap::new();
        for (section, map) in [
            (FEATURE_EXTRACTOR, &self.feature_extractor),
            (CLASSIFICATION_LAYER, &self.classification_layer),
        ] {
            flat.extend(
                map.iter()
                    .map(|(name, tensor)| (format!("{section}.{name}"), tensor.clone())),
            );
        }
        flat
    }
}

/// Groups flat tensor names by their first path segment.
pub fn split_sections(flat: TensorMap) -> Result<BTreeMap<String, TensorMap>> {
    let mut sections: BTreeMap<String, TensorMap> = BTreeMap::new();
    for (key, tensor) in flat {
        let (section, name) = key.split_once('.').ok_or_else(|| {
            TrainingError::incompatible(format!(
                "tensor '{}' does not belong to any model section",
                key
            ))
        })?;
        sections
            .entry(section.to_string())
            .or_default()
            .insert(name.to_string(), tensor);
    }
    Ok(sections)
}

/// Rewrites a legacy `model` section into the split layout. Sections already
/// in the split layout pass through unchanged, so applying this to its own
/// output is a no-op.
pub fn upgrade(mut sections: BTreeMap<String, TensorMap>) -> Result<CheckpointState> {
    if let Some(mut legacy) = sections.remove(LEGACY_SECTION) {
        if let Some(other) = sections.keys().next() {
            return Err(TrainingError::incompatible(format!(
                "legacy section '{}' cannot be combined with section '{}'",
                LEGACY_SECTION, other
            )));
        }

        let mut classification_layer = HashMap::new();
        for (legacy_name, name) in [(LEGACY_HEAD_WEIGHT, "weight"), (LEGACY_HEAD_BIAS, "bias")] {
            let tensor = legacy.remove(legacy_name).ok_or_else(|| {
                TrainingError::incompatible(format!(
                    "legacy checkpoint is missing head parameter '{}.{}'",
                    LEGACY_SECTION, legacy_name
                ))
            })?;
            classification_layer.insert(name.to_string(), tensor);
        }

        return Ok(CheckpointState {
            feature_extractor: legacy,
            classification_layer,
        });
    }

    let feature_extractor = sections.remove(FEATURE_EXTRACTOR);
    let classification_layer = sections.remove(CLASSIFICATION_LAYER).unwrap_or_default();
    if let Some(unknown) = sections.keys().next() {
        return Err(TrainingError::incompatible(format!(
            "unrecognized checkpoint section '{}'",
            unknown
        )));
    }
    let feature_extractor = feature_extractor.ok_or_else(|| {
        TrainingError::incompatible(format!(
            "checkpoint has neither a '{}' nor a '{}' section",
            FEATURE_EXTRACTOR, LEGACY_SECTION
        ))
    })?;

    Ok(CheckpointState {
        feature_extractor,
        classification_layer,
    })
}

/// Narrows a wider dense head to its first `n_classes` outputs. A head that
/// is narrower than `n_classes` cannot be widened and is rejected.
pub fn reconcile_head(mut state: CheckpointState, n_classes: usize) -> Result<CheckpointState> {
    let Some(width) = state.head_width() else {
        return Ok(state);
    };
    if width < n_classes {
        return Err(TrainingError::incompatible(format!(
            "classification head has {} outputs but {} classes were requested",
            width, n_classes
        )));
    }
    if width == n_classes {
        return Ok(state);
    }

    for name in ["weight", "bias"] {
        if let Some(tensor) = state.classification_layer.remove(name) {
            let narrowed = tensor.narrow(0, 0, n_classes)?.contiguous()?;
            state.classification_layer.insert(name.to_string(), narrowed);
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tensor(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn legacy_sections() -> BTreeMap<String, TensorMap> {
        let flat = HashMap::from([
            ("model.conv.weight".to_string(), tensor(&[4, 1, 3, 3])),
            ("model.fc.weight".to_string(), tensor(&[10, 8])),
            ("model.fc.bias".to_string(), tensor(&[10])),
        ]);
        split_sections(flat).unwrap()
    }

    #[test]
    fn legacy_head_moves_to_classification_layer() {
        let state = upgrade(legacy_sections()).unwrap();
        assert_eq!(state.feature_extractor.len(), 1);
        assert!(state.feature_extractor.contains_key("conv.weight"));
        assert_eq!(state.head_width(), Some(10));
        assert!(state.classification_layer.contains_key("bias"));
    }

    #[test]
    fn upgrade_is_idempotent() {
        let once = upgrade(legacy_sections()).unwrap();
        let twice = upgrade(split_sections(once.flatten()).unwrap()).unwrap();

        let mut a: Vec<_> = once.flatten().into_keys().collect();
        let mut b: Vec<_> = twice.flatten().into_keys().collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn mixed_layouts_are_rejected() {
        let mut sections = legacy_sections();
        sections.insert(FEATURE_EXTRACTOR.to_string(), HashMap::new());
        assert!(matches!(
            upgrade(sections),
            Err(TrainingError::IncompatibleCheckpoint(_))
        ));
    }

    #[test]
    fn legacy_without_head_is_rejected() {
        let flat = HashMap::from([("model.conv.weight".to_string(), tensor(&[2, 2]))]);
        let err = upgrade(split_sections(flat).unwrap()).unwrap_err();
        assert!(err.to_string().contains("fc.weight"));
    }

    #[test]
    fn head_is_truncated_to_requested_classes() {
        let state = upgrade(legacy_sections()).unwrap();
        let state = reconcile_head(state, 3).unwrap();
        assert_eq!(state.classification_layer["weight"].dims(), &[3, 8]);
        assert_eq!(state.classification_layer["bias"].dims(), &[3]);
    }

    #[test]
    fn narrower_head_is_incompatible() {
        let state = upgrade(legacy_sections()).unwrap();
        let err = reconcile_head(state, 11).unwrap_err();
        assert!(matches!(err, TrainingError::IncompatibleCheckpoint(_)));
        assert!(err.to_string().contains("10 outputs but 11 classes"));
    }

    #[test]
    fn identity_heads_pass_through() {
        let sections = split_sections(HashMap::from([(
            "feature_extractor.weight".to_string(),
            tensor(&[2, 3]),
        )]))
        .unwrap();
        let state = reconcile_head(upgrade(sections).unwrap(), 5).unwrap();
        assert!(state.classification_layer.is_empty());
    }
}
