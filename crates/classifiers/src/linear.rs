use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use training::{Architecture, Result, Stage, StageBuilder, TrainingConfig};

use crate::flattened_input;

struct FlattenLinear(Linear);

impl Module for FlattenLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.0.forward(&xs.flatten_from(1)?)
    }
}

/// Single dense layer over flattened inputs. It emits logits directly, so the
/// classification layer is an identity.
#[derive(Debug, Clone)]
pub struct LinearReadout {
    pub input_features: usize,
    pub n_classes: usize,
}

impl LinearReadout {
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        Ok(Self {
            input_features: flattened_input(config)?,
            n_classes: config.dataset.n_classes,
        })
    }
}

impl Architecture for LinearReadout {
    fn name(&self) -> &str {
        "linear"
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn feature_extractor(&self) -> StageBuilder {
        let (inputs, classes) = (self.input_features, self.n_classes);
        Arc::new(move |vb: VarBuilder| {
            Ok(Box::new(FlattenLinear(linear(inputs, classes, vb.pp("fc"))?)) as Box<dyn Stage>)
        })
    }

    fn classification_layer(&self) -> Option<StageBuilder> {
        None
    }
}
