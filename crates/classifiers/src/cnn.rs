use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Dropout, Linear,
    ModuleT, VarBuilder,
};
use training::{Architecture, Result, Stage, StageBuilder, TrainingConfig, TrainingError};

/// Convolution (padding 1), batch norm, ReLU and a 2x2 max-pool.
struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl ConvBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, kernel_size, config, vb.pp("conv"))?;
        let norm = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self { conv, norm })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, train)?;
        xs.relu()?.max_pool2d(2)
    }
}

struct CnnFeatures {
    blocks: Vec<ConvBlock>,
    fc: Linear,
    dropout: Dropout,
}

impl ModuleT for CnnFeatures {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }
        let xs = self.fc.forward(&xs.flatten_from(1)?)?.relu()?;
        self.dropout.forward(&xs, train)
    }
}

/// Stacked convolution blocks whose width doubles after the first block,
/// followed by a dense projection to `linear_output_size` features.
#[derive(Debug, Clone)]
pub struct Cnn {
    pub in_channels: usize,
    pub n_neurons: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub n_depth: usize,
    pub linear_output_size: usize,
    pub dropout: f32,
    pub n_classes: usize,
    /// Flattened feature count after the last block.
    pub conv_output_size: usize,
}

impl Cnn {
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        let hyper = &config.model.hyper;
        let (in_channels, height, width) = match config.dataset.input_size.as_slice() {
            [c, h, w] => (*c, *h, *w),
            other => {
                return Err(TrainingError::configuration(
                    "dataset.input_size",
                    format!("expected [channels, height, width], found {:?}", other),
                ))
            }
        };

        let mut spatial = (height, width);
        for block in 0..=hyper.n_depth {
            spatial = (
                block_output(spatial.0, hyper.kernel_size, hyper.stride),
                block_output(spatial.1, hyper.kernel_size, hyper.stride),
            );
            if spatial.0 == 0 || spatial.1 == 0 {
                return Err(TrainingError::configuration(
                    "model.hyper.n_depth",
                    format!(
                        "input {}x{} collapses to nothing after conv block {}",
                        height,
                        width,
                        block + 1
                    ),
                ));
            }
        }

        let out_channels = hyper.n_neurons << hyper.n_depth;
        Ok(Self {
            in_channels,
            n_neurons: hyper.n_neurons,
            kernel_size: hyper.kernel_size,
            stride: hyper.stride,
            n_depth: hyper.n_depth,
            linear_output_size: hyper.linear_output_size,
            dropout: hyper.dropout,
            n_classes: config.dataset.n_classes,
            conv_output_size: out_channels * spatial.0 * spatial.1,
        })
    }
}

/// Side length after one block: padded convolution, then 2x2 pooling.
fn block_output(size: usize, kernel_size: usize, stride: usize) -> usize {
    let padded = size + 2;
    if padded < kernel_size || stride == 0 {
        return 0;
    }
    ((padded - kernel_size) / stride + 1) / 2
}

impl Architecture for Cnn {
    fn name(&self) -> &str {
        "cnn"
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn feature_extractor(&self) -> StageBuilder {
        let spec = self.clone();
        Arc::new(move |vb: VarBuilder| {
            let mut blocks = Vec::with_capacity(spec.n_depth + 1);
            blocks.push(ConvBlock::new(
                spec.in_channels,
                spec.n_neurons,
                spec.kernel_size,
                spec.stride,
                vb.pp("blocks.0"),
            )?);
            for depth in 0..spec.n_depth {
                blocks.push(ConvBlock::new(
                    spec.n_neurons << depth,
                    spec.n_neurons << (depth + 1),
                    spec.kernel_size,
                    spec.stride,
                    vb.pp(format!("blocks.{}", depth + 1)),
                )?);
            }
            let fc = linear(spec.conv_output_size, spec.linear_output_size, vb.pp("fc"))?;
            Ok(Box::new(CnnFeatures {
                blocks,
                fc,
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
