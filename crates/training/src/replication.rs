//! Single- vs multi-device execution of model components.
//!
//! A [`Component`] owns one canonical parameter set on its primary device.
//! When replicated, each forward pass splits the batch along dim 0, runs every
//! chunk on its own device with parameters copied from the canonical set, and
//! gathers the outputs on the primary device. The copies are differentiable,
//! so backpropagation accumulates every replica's gradient into the canonical
//! parameters and the optimizer step stays a single serialized update.

use std::{collections::HashMap, sync::MutexGuard};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::info;

use crate::{
    device::{describe, detect_peer_devices},
    error::{Result, TrainingError},
    model::{Stage, StageBuilder},
};

/// Access to the canonical single-device parameters of a possibly replicated
/// component. Persistence always goes through this view so that checkpoints
/// never depend on how the component was executed.
pub trait Unwrap {
    fn is_replicated(&self) -> bool;
    fn unwrapped(&self) -> &VarMap;
}

pub struct Component {
    varmap: VarMap,
    stage: Box<dyn Stage>,
    builder: StageBuilder,
    device: Device,
    replicas: Vec<Device>,
}

impl Component {
    pub fn build(builder: StageBuilder, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let stage = builder(vb)?;
        Ok(Self {
            varmap,
            stage,
            builder,
            device: device.clone(),
            replicas: Vec::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Devices other than the primary one that currently execute chunks.
    pub fn replica_devices(&self) -> &[Device] {
        &self.replicas
    }

    pub fn replicate(&mut self, replicas: &[Device]) {
        self.replicas = replicas.to_vec();
    }

    pub fn collapse(&mut self) {
        self.replicas.clear();
    }

    pub fn parameter_count(&self) -> Result<usize> {
        Ok(lock_vars(&self.varmap)?
            .values()
            .map(|var| var.as_tensor().elem_count())
            .sum())
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        if self.replicas.is_empty() {
            return self.stage.forward_stage(xs, train);
        }

        let devices = std::iter::once(&self.device).chain(self.replicas.iter());
        let chunks = xs.chunk(self.replicas.len() + 1, 0)?;
        let mut outputs = Vec::with_capacity(chunks.len());
        for (index, (chunk, device)) in chunks.iter().zip(devices).enumerate() {
            let output = if index == 0 {
                self.stage.forward_stage(chunk, train)?
            } else {
                let replica = self.materialize_on(device)?;
                replica
                    .forward_stage(&chunk.to_device(device)?, train)?
                    .to_device(&self.device)?
            };
            outputs.push(output);
        }
        Tensor::cat(&outputs, 0)
    }

    /// Builds a throwaway copy of the stage on `device` whose weights are
    /// device copies of the canonical parameters, keeping the autograd link.
    fn materialize_on(&self, device: &Device) -> candle_core::Result<Box<dyn Stage>> {
        let tensors = {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("parameter map lock poisoned".into()))?;
            vars.iter()
                .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_device(device)?)))
                .collect::<candle_core::Result<HashMap<String, Tensor>>>()?
        };
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        (self.builder)(vb)
    }
}

impl Unwrap for Component {
    fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }

    fn unwrapped(&self) -> &VarMap {
        &self.varmap
    }
}

/// Which devices a session runs on: always one primary device, plus zero or
/// more replicas when several are available.
#[derive(Debug, Clone)]
pub struct ReplicationPlan {
    primary: Device,
    replicas: Vec<Device>,
}

impl ReplicationPlan {
    pub fn single(primary: &Device) -> Self {
        Self {
            primary: primary.clone(),
            replicas: Vec::new(),
        }
    }

    /// Looks for peer devices of the primary's backend.
    pub fn detect(primary: &Device) -> Self {
        Self {
            primary: primary.clone(),
            replicas: detect_peer_devices(primary),
        }
    }

    /// Explicit device list; the first entry becomes the primary device.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        let mut devices = devices.into_iter();
        let primary = devices
            .next()
            .ok_or_else(|| TrainingError::runtime("replication plan requires at least one device"))?;
        Ok(Self {
            primary,
            replicas: devices.collect(),
        })
    }

    pub fn primary(&self) -> &Device {
        &self.primary
    }

    pub fn replicas(&self) -> &[Device] {
        &self.replicas
    }

    pub fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.replicas.len() + 1
    }

    pub fn apply(&self, components: [&mut Component; 2]) {
        if self.is_replicated() {
            let names: Vec<String> = std::iter::once(&self.primary)
                .chain(self.replicas.iter())
                .map(describe)
                .collect();
            info!("replicating model across {} devices: {}", names.len(), names.join(", "));
        }
        for component in components {
            component.replicate(&self.replicas);
        }
    }
}

pub(crate) fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("parameter map lock poisoned"))
}
