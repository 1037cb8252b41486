//! Runtime configuration
//!
//! Built programmatically or read from the environment:
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `GNA_THREADS` | `1..=127` | `1` |
//! | `GNA_DRIVER` | `auto`, `kernel`, `simulated[:<generation>]`, `none` | `auto` |
//! | `GNA_DEVICE_INDEX` | device node index | `0` |
//! | `GNA_MAX_PENDING_REQUESTS` | `1..=64` | `64` |
//!
//! `simulated` without a generation simulates a GNA 3.0 device.

use gna_chip::DeviceVersion;
use gna_driver::DriverSelection;

use crate::error::{GnaError, Result};

/// Largest accepted worker thread count.
pub const MAX_THREADS: usize = 127;

/// Largest accepted pending-request limit.
pub const MAX_PENDING_REQUESTS: usize = 64;

/// Configuration of one [`Device`](crate::Device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads executing requests.
    pub threads: usize,
    /// Driver to open, `None` for software-only execution.
    pub driver: Option<DriverSelection>,
    /// Device node index passed to the driver.
    pub device_index: usize,
    /// Requests that may be pending before enqueue reports a full queue.
    pub max_pending_requests: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            driver: Some(DriverSelection::Auto),
            device_index: 0,
            max_pending_requests: MAX_PENDING_REQUESTS,
        }
    }
}

impl RuntimeConfig {
    /// Software-only configuration.
    #[must_use]
    pub fn software() -> Self {
        Self {
            driver: None,
            ..Self::default()
        }
    }

    /// Read the configuration from `GNA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidConfiguration` for malformed values.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidConfiguration` for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup("GNA_THREADS") {
            config.threads = parse_number("GNA_THREADS", &value)?;
        }
        if let Some(value) = lookup("GNA_DRIVER") {
            config.driver = parse_driver(&value)?;
        }
        if let Some(value) = lookup("GNA_DEVICE_INDEX") {
            config.device_index = parse_number("GNA_DEVICE_INDEX", &value)?;
        }
        if let Some(value) = lookup("GNA_MAX_PENDING_REQUESTS") {
            config.max_pending_requests = parse_number("GNA_MAX_PENDING_REQUESTS", &value)?;
        }
        config.validate()?;
        tracing::debug!("Runtime configuration: {config:?}");
        Ok(config)
    }

    /// Set the worker thread count
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the driver selection
    #[must_use]
    pub const fn with_driver(mut self, driver: Option<DriverSelection>) -> Self {
        self.driver = driver;
        self
    }

    /// Set the device index
    #[must_use]
    pub const fn with_device_index(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    /// Set the pending-request limit
    #[must_use]
    pub const fn with_max_pending_requests(mut self, limit: usize) -> Self {
        self.max_pending_requests = limit;
        self
    }

    /// Check every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidThreadCount` or
    /// `GnaError::InvalidConfiguration`.
    pub fn validate(&self) -> Result<()> {
        check_thread_count(self.threads)?;
        if !(1..=MAX_PENDING_REQUESTS).contains(&self.max_pending_requests) {
            return Err(GnaError::invalid_configuration(format!(
                "pending-request limit {} outside 1..={MAX_PENDING_REQUESTS}",
                self.max_pending_requests
            )));
        }
        Ok(())
    }
}

/// Check a worker thread count.
pub(crate) fn check_thread_count(count: usize) -> Result<()> {
    if (1..=MAX_THREADS).contains(&count) {
        Ok(())
    } else {
        Err(GnaError::InvalidThreadCount {
            count,
            max: MAX_THREADS,
        })
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| GnaError::invalid_configuration(format!("{key}={value}: {e}")))
}

fn parse_driver(value: &str) -> Result<Option<DriverSelection>> {
    let value = value.trim().to_ascii_lowercase();
    let selection = match value.split_once(':') {
        None => match value.as_str() {
            "auto" => Some(DriverSelection::Auto),
            "kernel" => Some(DriverSelection::Kernel),
            "simulated" => Some(DriverSelection::Simulated(DeviceVersion::Gna3_0)),
            "none" | "software" => None,
            other => {
                return Err(GnaError::invalid_configuration(format!(
                    "unknown driver '{other}'; expected auto, kernel, simulated or none"
                )))
            }
        },
        Some(("simulated", generation)) => {
            let version = DeviceVersion::from_name(generation).ok_or_else(|| {
                GnaError::invalid_configuration(format!("unknown generation '{generation}'"))
            })?;
            Some(DriverSelection::Simulated(version))
        }
        Some(_) => {
            return Err(GnaError::invalid_configuration(format!(
                "unknown driver '{value}'"
            )))
        }
    };
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.max_pending_requests, 64);
    }

    #[test]
    fn reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("GNA_THREADS", "4"),
            ("GNA_DRIVER", "simulated:1.0"),
            ("GNA_DEVICE_INDEX", "1"),
            ("GNA_MAX_PENDING_REQUESTS", "8"),
        ]))
        .unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(
            config.driver,
            Some(DriverSelection::Simulated(DeviceVersion::Gna1_0))
        );
        assert_eq!(config.device_index, 1);
        assert_eq!(config.max_pending_requests, 8);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = RuntimeConfig::from_lookup(lookup(&[("GNA_THREADS", "128")])).unwrap_err();
        assert!(matches!(err, GnaError::InvalidThreadCount { count: 128, .. }));

        let err =
            RuntimeConfig::from_lookup(lookup(&[("GNA_MAX_PENDING_REQUESTS", "0")])).unwrap_err();
        assert!(matches!(err, GnaError::InvalidConfiguration { .. }));

        assert!(RuntimeConfig::from_lookup(lookup(&[("GNA_DRIVER", "vfio")])).is_err());
    }

    #[test]
    fn none_disables_the_driver() {
        let config = RuntimeConfig::from_lookup(lookup(&[("GNA_DRIVER", "none")])).unwrap();
        assert_eq!(config.driver, None);
        assert_eq!(RuntimeConfig::software().driver, None);
    }
}
