//! Concrete classifier architectures for the `training` engine.

pub mod cnn;
pub mod linear;
pub mod mlp;
pub mod overrides;

use candle_core::Device;
use log::info;
use training::{Classifier, Result, TrainingConfig, TrainingError};

pub use cnn::Cnn;
pub use linear::LinearReadout;
pub use mlp::Mlp;

/// Builds the classifier named by `model.name` on `device`.
pub fn get_model(config: &TrainingConfig, device: &Device) -> Result<Classifier> {
    let name = config.model.name.trim().to_ascii_lowercase();
    let model = match name.as_str() {
        "cnn" => Classifier::new(&Cnn::from_config(config)?, device)?,
        "mlp" => Classifier::new(&Mlp::from_config(config)?, device)?,
        "linear" => Classifier::new(&LinearReadout::from_config(config)?, device)?,
        other => {
            return Err(TrainingError::configuration(
                "model.name",
                format!("unknown model '{}'; expected cnn, mlp or linear", other),
            ))
        }
    };
    info!("built {} classifier with {} classes", model.name(), config.dataset.n_classes);
    Ok(model)
}

/// Number of features in one flattened input example.
pub(crate) fn flattened_input(config: &TrainingConfig) -> Result<usize> {
    let features: usize = config.dataset.input_size.iter().product();
    if config.dataset.input_size.is_empty() || features == 0 {
        return Err(TrainingError::configuration(
            "dataset.input_size",
            "must list non-zero dimensions",
        ));
    }
    Ok(features)
}
