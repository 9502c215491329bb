use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{linear, Dropout, Linear, ModuleT, VarBuilder};
use training::{Architecture, Result, Stage, StageBuilder, TrainingConfig};

use crate::flattened_input;

struct MlpFeatures {
    hidden: Vec<Linear>,
    projection: Linear,
    dropout: Dropout,
}

impl ModuleT for MlpFeatures {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.flatten_from(1)?;
        for layer in &self.hidden {
            xs = layer.forward(&xs)?.relu()?;
        }
        let xs = self.projection.forward(&xs)?.relu()?;
        self.dropout.forward(&xs, train)
    }
}

/// Fully connected network: `n_depth + 1` hidden layers of `n_neurons`
/// units, then a projection to `linear_output_size` features.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub input_features: usize,
    pub n_neurons: usize,
    pub n_depth: usize,
    pub linear_output_size: usize,
    pub dropout: f32,
    pub n_classes: usize,
}

impl Mlp {
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        let hyper = &config.model.hyper;
        Ok(Self {
            input_features: flattened_input(config)?,
            n_neurons: hyper.n_neurons,
            n_depth: hyper.n_depth,
            linear_output_size: hyper.linear_output_size,
            dropout: hyper.dropout,
            n_classes: config.dataset.n_classes,
        })
    }
}

impl Architecture for Mlp {
    fn name(&self) -> &str {
        "mlp"
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn feature_extractor(&self) -> StageBuilder {
        let spec = self.clone();
        Arc::new(move |vb: VarBuilder| {
            let mut hidden = Vec::with_capacity(spec.n_depth + 1);
            let mut width = spec.input_features;
            for index in 0..=spec.n_depth {
                hidden.push(linear(width, spec.n_neurons, vb.pp(format!("hidden.{index}")))?);
                width = spec.n_neurons;
            }
            let projection = linear(width, spec.linear_output_size, vb.pp("fc"))?;
            Ok(Box::new(MlpFeatures {
                hidden,
                projection,
                dropout: Dropout::new(spec.dropout),
            }) as Box<dyn Stage>)
        })
    }

    fn classification_layer(&self) -> Option<StageBuilder> {
        let (features, classes) = (self.linear_output_size, self.n_classes);
        Some(Arc::new(move |vb: VarBuilder| {
            Ok(Box::new(linear(features, classes, vb)?) as Box<dyn Stage>)
        }))
    }
}
