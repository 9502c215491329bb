use std::sync::Arc;

use candle_core::{Device, Module, Tensor, Var, D};
use candle_nn::{ModuleT, VarBuilder};

use crate::{
    error::Result,
    replication::{lock_vars, Component, Unwrap},
};

pub const FEATURE_EXTRACTOR: &str = "feature_extractor";
pub const CLASSIFICATION_LAYER: &str = "classification_layer";

/// One stage of a classifier. `train` toggles dropout and batch-norm statistics.
pub trait Stage {
    fn forward_stage(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor>;
}

impl<M: ModuleT> Stage for M {
    fn forward_stage(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        ModuleT::forward_t(self, xs, train)
    }
}

/// Constructs a stage from a variable builder. Kept alongside the component so
/// replicas can be rebuilt on other devices from the same recipe.
pub type StageBuilder =
    Arc<dyn Fn(VarBuilder) -> candle_core::Result<Box<dyn Stage>> + Send + Sync>;

/// Pass-through head for architectures that produce logits directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Module for Identity {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Ok(xs.clone())
    }
}

pub fn identity_builder() -> StageBuilder {
    Arc::new(|_vb: VarBuilder| Ok(Box::new(Identity) as Box<dyn Stage>))
}

/// Recipe for a concrete network: a feature extractor followed by an optional
/// classification head (`None` means the extractor already emits logits).
pub trait Architecture {
    fn name(&self) -> &str;
    fn n_classes(&self) -> usize;
    fn feature_extractor(&self) -> StageBuilder;
    fn classification_layer(&self) -> Option<StageBuilder>;
}

/// Capability the training engine relies on. The checkpoint manager and the
/// trainer only ever see this trait, never a concrete architecture.
pub trait TrainableClassifier {
    fn feature_extractor(&self) -> &Component;
    fn classification_layer(&self) -> &Component;
    fn components_mut(&mut self) -> [&mut Component; 2];
    fn n_classes(&self) -> usize;
    fn device(&self) -> &Device;
    fn is_training(&self) -> bool;
    fn set_training(&mut self, training: bool);

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let train = self.is_training();
        let features = self.feature_extractor().forward_t(xs, train)?;
        Ok(self.classification_layer().forward_t(&features, train)?)
    }

    /// Predicted class index per example.
    fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward(xs)?.argmax(D::Minus1)?)
    }

    fn state_components(&self) -> [(&'static str, &dyn Unwrap); 2] {
        [
            (FEATURE_EXTRACTOR, self.feature_extractor() as &dyn Unwrap),
            (CLASSIFICATION_LAYER, self.classification_layer() as &dyn Unwrap),
        ]
    }

    /// Every canonical parameter, named `<component>.<parameter>` and sorted.
    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut named = Vec::new();
        for (prefix, component) in self.state_components() {
            let vars = lock_vars(component.unwrapped())?;
            named.extend(
                vars.iter()
                    .map(|(name, var)| (format!("{prefix}.{name}"), var.clone())),
            );
        }
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }
}

/// Default two-stage classifier assembled from an [`Architecture`].
pub struct Classifier {
    name: String,
    feature_extractor: Component,
    classification_layer: Component,
    n_classes: usize,
    device: Device,
    training: bool,
}

impl Classifier {
    pub fn new(architecture: &dyn Architecture, device: &Device) -> Result<Self> {
        let feature_extractor = Component::build(architecture.feature_extractor(), device)?;
        let head = architecture
            .classification_layer()
            .unwrap_or_else(identity_builder);
        let classification_layer = Component::build(head, device)?;
        Ok(Self {
            name: architecture.name().to_string(),
            feature_extractor,
            classification_layer,
            n_classes: architecture.n_classes(),
            device: device.clone(),
            training: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TrainableClassifier for Classifier {
    fn feature_extractor(&self) -> &Component {
        &self.feature_extractor
    }

    fn classification_layer(&self) -> &Component {
        &self.classification_layer
    }

    fn components_mut(&mut self) -> [&mut Component; 2] {
        [&mut self.feature_extractor, &mut self.classification_layer]
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
