use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use log::{info, warn};

use crate::error::{Result, TrainingError};

/// Upper bound when scanning for additional CUDA ordinals.
const MAX_PEER_DEVICES: usize = 16;

/// Compute device requested by `training.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let normalized = value.trim().to_ascii_lowercase();
        let (backend, ordinal) = match normalized.split_once(':') {
            Some((backend, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device ordinal in '{}'", value))?;
                (backend, Some(ordinal))
            }
            None => (normalized.as_str(), None),
        };

        match (backend, ordinal) {
            ("auto", None) => Ok(DeviceSpec::Auto),
            ("cpu", None) => Ok(DeviceSpec::Cpu),
            ("cuda", ordinal) => Ok(DeviceSpec::Cuda(ordinal.unwrap_or(0))),
            ("metal" | "mps", ordinal) => Ok(DeviceSpec::Metal(ordinal.unwrap_or(0))),
            _ => Err(format!(
                "unrecognized device '{}' (expected auto, cpu, cuda[:N] or metal[:N])",
                value
            )),
        }
    }

    /// Instantiates the device. `Auto` prefers CUDA, then Metal, then CPU, and
    /// falls back to CPU when an accelerator fails to initialize.
    pub fn resolve(self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                TrainingError::configuration(
                    "training.device",
                    format!("cuda:{ordinal} is not usable: {err}"),
                )
            }),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal).map_err(|err| {
                TrainingError::configuration(
                    "training.device",
                    format!("metal:{ordinal} is not usable: {err}"),
                )
            }),
            DeviceSpec::Auto => {
                let cuda_available = cuda_is_available();
                let metal_available = metal_is_available();
                info!(
                    "device detection: cuda_available={} metal_available={}",
                    cuda_available, metal_available
                );
                if cuda_available {
                    match Device::new_cuda(0) {
                        Ok(device) => return Ok(device),
                        Err(err) => warn!("cuda reported available but initialization failed: {err}"),
                    }
                }
                if metal_available {
                    match Device::new_metal(0) {
                        Ok(device) => return Ok(device),
                        Err(err) => warn!("failed to initialize metal device, falling back to CPU: {err}"),
                    }
                }
                Ok(Device::Cpu)
            }
        }
    }
}

/// Additional devices of the same backend as `primary`, usable as data-parallel
/// replicas. Only CUDA exposes more than one ordinal to a single process.
pub fn detect_peer_devices(primary: &Device) -> Vec<Device> {
    if !primary.is_cuda() {
        return Vec::new();
    }
    (0..MAX_PEER_DEVICES)
        .map_while(|ordinal| Device::new_cuda(ordinal).ok())
        .filter(|device| device.location() != primary.location())
        .collect()
}

pub fn describe(device: &Device) -> String {
    match device.location() {
        candle_core::DeviceLocation::Cpu => "cpu".to_string(),
        candle_core::DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        candle_core::DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_identifiers() {
        assert_eq!(DeviceSpec::parse("auto"), Ok(DeviceSpec::Auto));
        assert_eq!(DeviceSpec::parse("CPU"), Ok(DeviceSpec::Cpu));
        assert_eq!(DeviceSpec::parse("cuda"), Ok(DeviceSpec::Cuda(0)));
        assert_eq!(DeviceSpec::parse("cuda:3"), Ok(DeviceSpec::Cuda(3)));
        assert_eq!(DeviceSpec::parse("metal:1"), Ok(DeviceSpec::Metal(1)));
    }

    #[test]
    fn rejects_unknown_identifiers() {
        assert!(DeviceSpec::parse("tpu").is_err());
        assert!(DeviceSpec::parse("cuda:x").is_err());
        assert!(DeviceSpec::parse("cpu:1").is_err());
    }

    #[test]
    fn cpu_has_no_peers() -> anyhow::Result<()> {
        let device = DeviceSpec::Cpu.resolve()?;
        assert!(device.is_cpu());
        assert!(detect_peer_devices(&device).is_empty());
        assert_eq!(describe(&device), "cpu");
        Ok(())
    }
}
