//! Resolution of string device identifiers.
//!
//! Accepted forms: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N` and `auto`.
//! `auto` picks Metal, then CUDA, then CPU, following whatever backends the
//! build was compiled with.

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

use crate::errors::{GradientError, Result};

/// Something that names the compute device for a snapshot.
pub trait TargetDevice {
    fn resolve(&self) -> Result<Device>;
}

impl TargetDevice for Device {
    fn resolve(&self) -> Result<Device> {
        Ok(self.clone())
    }
}

impl TargetDevice for str {
    fn resolve(&self) -> Result<Device> {
        parse_device(self)
    }
}

impl TargetDevice for String {
    fn resolve(&self) -> Result<Device> {
        parse_device(self)
    }
}

impl<T: TargetDevice + ?Sized> TargetDevice for &T {
    fn resolve(&self) -> Result<Device> {
        (**self).resolve()
    }
}

pub fn parse_device(identifier: &str) -> Result<Device> {
    let normalized = identifier.trim().to_ascii_lowercase();
    let (kind, ordinal) = match normalized.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse::<usize>().map_err(|err| {
                GradientError::device(
                    identifier,
                    candle_core::Error::Msg(format!("invalid device ordinal: {err}")),
                )
            })?;
            (kind.to_string(), Some(ordinal))
        }
        None => (normalized, None),
    };

    match (kind.as_str(), ordinal) {
        ("cpu", None) => Ok(Device::Cpu),
        ("cuda" | "gpu", ordinal) => Device::new_cuda(ordinal.unwrap_or(0))
            .map_err(|err| GradientError::device(identifier, err)),
        ("metal" | "mps", ordinal) => Device::new_metal(ordinal.unwrap_or(0))
            .map_err(|err| GradientError::device(identifier, err)),
        ("auto", None) => Ok(auto_device()),
        _ => Err(GradientError::device(
            identifier,
            candle_core::Error::Msg("unknown device identifier".into()),
        )),
    }
}

fn auto_device() -> Device {
    if metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    if cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    Device::Cpu
}

/// Short human-readable device label for logs and reports.
pub fn device_label(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => "cuda".to_string(),
        Device::Metal(_) => "metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_case_insensitively() {
        assert!(parse_device("cpu").unwrap().is_cpu());
        assert!(parse_device(" CPU ").unwrap().is_cpu());
        assert!("cpu".resolve().unwrap().is_cpu());
    }

    #[test]
    fn rejects_unknown_identifiers() {
        for identifier in ["tpu", "cpu:0", "cuda:x", ""] {
            match parse_device(identifier) {
                Err(GradientError::Device { device, .. }) => assert_eq!(device, identifier),
                other => panic!("expected device error for {identifier:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn auto_always_resolves() {
        let device = parse_device("auto").unwrap();
        assert!(!device_label(&device).is_empty());
    }
}
