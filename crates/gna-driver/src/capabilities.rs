//! Capabilities reported by the driver for one opened device.

use std::time::Duration;

use gna_chip::{DeviceVersion, HardwareCapabilities};

/// Runtime-queried device parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Hardware generation of the device.
    pub device_version: DeviceVersion,
    /// On-chip input buffer size in KiB.
    pub buffer_size_kb: u32,
    /// Interval after which a hung submission is treated as failed.
    pub recovery_timeout_ms: u64,
}

impl DriverCapabilities {
    /// Capabilities of a generation with its default buffer size.
    #[must_use]
    pub const fn for_version(device_version: DeviceVersion, recovery_timeout_ms: u64) -> Self {
        Self {
            device_version,
            buffer_size_kb: HardwareCapabilities::for_version(device_version).input_buffer_kb,
            recovery_timeout_ms,
        }
    }

    /// How long `submit` waits before declaring the device failed:
    /// the recovery timeout rounded up to whole seconds, plus one second.
    #[must_use]
    pub const fn submit_timeout(&self) -> Duration {
        let recovery_s = self.recovery_timeout_ms.div_ceil(1000);
        Duration::from_secs(recovery_s + 1)
    }

    /// Input buffer size in bytes.
    #[must_use]
    pub const fn buffer_size_bytes(&self) -> usize {
        self.buffer_size_kb as usize * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_timeout_adds_one_second() {
        let caps = DriverCapabilities::for_version(DeviceVersion::Gna2_0, 3000);
        assert_eq!(caps.submit_timeout(), Duration::from_secs(4));

        let caps = DriverCapabilities::for_version(DeviceVersion::Gna2_0, 1500);
        assert_eq!(caps.submit_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn default_buffer_follows_generation() {
        let caps = DriverCapabilities::for_version(DeviceVersion::Gna3_0, 1000);
        assert_eq!(caps.buffer_size_bytes(), 24 * 1024);
    }
}
