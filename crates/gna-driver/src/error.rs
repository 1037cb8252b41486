//! Error types for driver operations

use std::path::PathBuf;
use thiserror::Error;

use crate::status::HardwareFault;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur at the driver boundary
#[derive(Debug, Error)]
pub enum DriverError {
    /// Device node not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No accelerator detected on the system
    #[error("No GNA devices detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Memory mapping was refused or never confirmed
    #[error("Memory map failed: {reason}")]
    MapFailed {
        /// Reason for failure
        reason: String,
    },

    /// Driver handed out the reserved identifier
    #[error("Driver returned the forbidden memory identifier")]
    ForbiddenMemoryId,

    /// Identifier is not a live mapping
    #[error("Unknown memory identifier {id}")]
    UnknownMemoryId {
        /// Offending identifier
        id: u64,
    },

    /// Submission rejected by the driver
    #[error("Submission failed: {reason}")]
    SubmitFailed {
        /// Reason for failure
        reason: String,
    },

    /// Device did not complete within the recovery window
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Device is busy with another request
    #[error("Device busy")]
    Busy,

    /// Hardware reported a fault
    #[error("Hardware fault {fault:?} (status {status:#x})")]
    Hardware {
        /// Decoded fault
        fault: HardwareFault,
        /// Raw status register
        status: u32,
    },

    /// Device capability query failed
    #[error("Failed to query device capabilities: {reason}")]
    CapabilityQueryFailed {
        /// Reason for failure
        reason: String,
    },

    /// Submission payload is malformed
    #[error("Invalid submission payload: {reason}")]
    InvalidPayload {
        /// Reason for failure
        reason: String,
    },
}

impl DriverError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a map failed error
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }

    /// Create a submit failed error
    pub fn submit_failed(reason: impl Into<String>) -> Self {
        Self::SubmitFailed {
            reason: reason.into(),
        }
    }

    /// Create a capability query failed error
    pub fn capability_query_failed(reason: impl Into<String>) -> Self {
        Self::CapabilityQueryFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }
}
