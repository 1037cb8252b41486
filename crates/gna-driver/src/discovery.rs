//! Runtime device discovery
//!
//! Scans `/dev/gna*` nodes and matches them against accelerator functions
//! listed in PCI sysfs.

use std::path::{Path, PathBuf};

use gna_chip::pcie::{generation_of, INTEL_VENDOR_ID};
use gna_chip::DeviceVersion;

use crate::backends::kernel::KernelDriver;
use crate::error::{DriverError, Result};

/// Highest device node index scanned.
const MAX_DEVICE_NODES: usize = 16;

/// Device manager for runtime discovery and access
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

/// Information about a discovered device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device index (0, 1, 2, ...)
    pub index: usize,

    /// Device node path (/dev/gna0, etc.)
    pub path: PathBuf,

    /// PCI bus address, if matched in sysfs
    pub pcie_address: Option<String>,

    /// PCI device id, if matched in sysfs
    pub device_id: Option<u16>,

    /// Generation inferred from the PCI device id
    pub version: Option<DeviceVersion>,
}

impl DeviceManager {
    /// Discover all accelerator nodes on the system
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NoDevicesFound` if no device node exists.
    pub fn discover() -> Result<Self> {
        tracing::info!("Discovering GNA devices...");

        let functions = Self::pci_functions(Path::new("/sys/bus/pci/devices"));
        let mut devices = Vec::new();

        for index in 0..MAX_DEVICE_NODES {
            let path = PathBuf::from(format!("/dev/gna{index}"));
            if !path.exists() {
                continue;
            }
            tracing::debug!("Found device file: {}", path.display());

            let (pcie_address, device_id) = match functions.get(index) {
                Some((address, id)) => (Some(address.clone()), Some(*id)),
                None => {
                    tracing::warn!("No PCI function matched for {}", path.display());
                    (None, None)
                }
            };
            let version = device_id.and_then(generation_of);

            tracing::info!(
                "Device {index}: {} @ {}",
                version.map_or_else(|| "unknown generation".to_string(), |v| v.to_string()),
                pcie_address.as_deref().unwrap_or("?")
            );
            devices.push(DeviceInfo {
                index,
                path,
                pcie_address,
                device_id,
                version,
            });
        }

        if devices.is_empty() {
            tracing::debug!("No GNA devices found");
            return Err(DriverError::NoDevicesFound);
        }
        tracing::info!("Discovered {} GNA device(s)", devices.len());
        Ok(Self { devices })
    }

    /// Get number of discovered devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get slice of all devices
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Get device info by index
    ///
    /// # Errors
    ///
    /// Returns `DriverError::InvalidIndex` if no device has that index.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.index == index)
            .ok_or(DriverError::InvalidIndex {
                index,
                count: self.devices.len(),
            })
    }

    /// Open the kernel driver for a device
    ///
    /// # Errors
    ///
    /// Returns an error if the index is invalid or the node cannot be opened.
    pub fn open(&self, index: usize) -> Result<KernelDriver> {
        KernelDriver::open_path(&self.device(index)?.path)
    }

    /// Accelerator PCI functions under `root`, sorted by bus address.
    fn pci_functions(root: &Path) -> Vec<(String, u16)> {
        let Ok(entries) = std::fs::read_dir(root) else {
            tracing::debug!("Cannot read {}", root.display());
            return Vec::new();
        };

        let mut matches: Vec<(String, u16)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let vendor = Self::read_hex_sysfs(&path.join("vendor")).ok()?;
                let device = Self::read_hex_sysfs(&path.join("device")).ok()?;
                (vendor == INTEL_VENDOR_ID && generation_of(device).is_some())
                    .then(|| (entry.file_name().to_string_lossy().to_string(), device))
            })
            .collect();
        matches.sort();
        matches
    }

    /// Read a hexadecimal value from sysfs
    fn read_hex_sysfs(path: &Path) -> Result<u16> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::capability_query_failed(format!("Cannot read {}: {e}", path.display()))
        })?;

        let trimmed = content.trim().trim_start_matches("0x");

        u16::from_str_radix(trimmed, 16)
            .map_err(|e| DriverError::capability_query_failed(format!("Invalid hex value: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_scan_matches_known_functions() {
        let root = tempfile::tempdir().unwrap();
        let write = |name: &str, vendor: &str, device: &str| {
            let dir = root.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("vendor"), vendor).unwrap();
            std::fs::write(dir.join("device"), device).unwrap();
        };
        write("0000:00:08.0", "0x8086\n", "0x9a11\n");
        write("0000:00:02.0", "0x8086\n", "0x9a49\n");
        write("0000:00:01.0", "0x10de\n", "0x9a11\n");

        let found = DeviceManager::pci_functions(root.path());
        assert_eq!(found, vec![("0000:00:08.0".to_string(), 0x9A11)]);
    }

    #[test]
    fn test_device_discovery() {
        match DeviceManager::discover() {
            Ok(manager) => {
                for device in manager.devices() {
                    println!("Device {}: {}", device.index, device.path.display());
                }
            }
            Err(DriverError::NoDevicesFound) => {
                println!("No devices found (hardware required)");
            }
            Err(e) => panic!("unexpected discovery error: {e}"),
        }
    }
}
