//! Compute device selection.

use medbundle_core::core::{BundleError, BundleResult};
use std::fmt;
use std::str::FromStr;

/// Where a network runs.
///
/// Only the CPU backend is compiled in. CUDA devices parse so that bundle
/// configurations stay portable, but report themselves as unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Whether computations can be placed on this device.
    pub fn is_available(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Returns an error unless the device is available.
    pub fn ensure_available(&self) -> BundleResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BundleError::DeviceUnavailable {
                device: self.to_string(),
            })
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| {
                    BundleError::config_error_with_context(
                        "device",
                        s,
                        "expected cpu, cuda or cuda:N",
                    )
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_strings() -> Result<(), BundleError> {
        assert_eq!("cpu".parse::<Device>()?, Device::Cpu);
        assert_eq!(" CUDA ".parse::<Device>()?, Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>()?, Device::Cuda(3));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        Ok(())
    }

    #[test]
    fn display_round_trips() -> Result<(), BundleError> {
        for device in [Device::Cpu, Device::Cuda(1)] {
            assert_eq!(device.to_string().parse::<Device>()?, device);
        }
        Ok(())
    }

    #[test]
    fn only_cpu_is_available() {
        assert!(Device::Cpu.ensure_available().is_ok());
        let err = Device::Cuda(0).ensure_available().unwrap_err();
        assert!(matches!(err, BundleError::DeviceUnavailable { .. }));
    }
}
