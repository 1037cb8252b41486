//! Status taxonomy and error types of the runtime

use std::fmt;

use gna_driver::{DriverError, HardwareFault};
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, GnaError>;

/// Closed set of outcomes the runtime reports.
///
/// Warnings still count as success: the request produced scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Completed without remarks
    Success,
    /// Completed, but some outputs were clamped to the output range
    WarningArithmeticSaturation,
    /// The request has not finished yet and can be waited on again
    WarningDeviceBusy,
    /// Unknown model, configuration, request or memory identifier
    ErrorIdentifierInvalid,
    /// Allocation or identifier space exhausted
    ErrorResourceExhausted,
    /// Too many pending requests
    ErrorQueueFull,
    /// No device available for a hardware-only request
    ErrorDeviceNotAvailable,
    /// Device MMU fault
    ErrorDeviceMmu,
    /// Device DMA fault
    ErrorDeviceDma,
    /// Device signalled a completion nobody asked for
    ErrorDeviceUnexpectedCompletion,
    /// Device accessed an address outside the mapped range
    ErrorDeviceVaOutOfRange,
    /// Device rejected a descriptor parameter
    ErrorDeviceParamOutOfRange,
    /// Device stopped responding within the recovery window
    ErrorDeviceCriticalFailure,
    /// Driver call failed
    ErrorDeviceIoctl,
    /// Operation or data mode not supported
    ErrorUnsupportedOperation,
    /// Model failed validation
    ErrorModelInvalid,
    /// Buffer range outside any known allocation
    ErrorMemoryOutOfBounds,
    /// Memory still referenced by a model, configuration or request
    ErrorMemoryInUse,
    /// Worker thread count outside the accepted range
    ErrorInvalidThreadCount,
    /// Acceleration mode not available on this host
    ErrorAccelerationModeNotSupported,
    /// Configuration value rejected
    ErrorInvalidConfiguration,
    /// Failure without a more specific status
    ErrorUnknown,
}

impl Status {
    /// Whether the outcome produced scores.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::WarningArithmeticSaturation)
    }

    /// Whether the outcome is a warning.
    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(
            self,
            Self::WarningArithmeticSaturation | Self::WarningDeviceBusy
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::WarningArithmeticSaturation => "warning: arithmetic saturation",
            Self::WarningDeviceBusy => "warning: device busy",
            Self::ErrorIdentifierInvalid => "error: invalid identifier",
            Self::ErrorResourceExhausted => "error: resources exhausted",
            Self::ErrorQueueFull => "error: request queue full",
            Self::ErrorDeviceNotAvailable => "error: device not available",
            Self::ErrorDeviceMmu => "error: device MMU fault",
            Self::ErrorDeviceDma => "error: device DMA fault",
            Self::ErrorDeviceUnexpectedCompletion => "error: unexpected device completion",
            Self::ErrorDeviceVaOutOfRange => "error: device address out of range",
            Self::ErrorDeviceParamOutOfRange => "error: device parameter out of range",
            Self::ErrorDeviceCriticalFailure => "error: device critical failure",
            Self::ErrorDeviceIoctl => "error: driver call failed",
            Self::ErrorUnsupportedOperation => "error: unsupported operation",
            Self::ErrorModelInvalid => "error: invalid model",
            Self::ErrorMemoryOutOfBounds => "error: memory out of bounds",
            Self::ErrorMemoryInUse => "error: memory in use",
            Self::ErrorInvalidThreadCount => "error: invalid thread count",
            Self::ErrorAccelerationModeNotSupported => "error: acceleration mode not supported",
            Self::ErrorInvalidConfiguration => "error: invalid configuration",
            Self::ErrorUnknown => "error: unknown",
        };
        f.write_str(text)
    }
}

/// Errors raised by the runtime
#[derive(Debug, Error)]
pub enum GnaError {
    /// Identifier does not name a live object
    #[error("Unknown {kind} identifier {id}")]
    InvalidIdentifier {
        /// Object kind ("model", "request", ...)
        kind: &'static str,
        /// Offending identifier
        id: u64,
    },

    /// Allocation or identifier space exhausted
    #[error("Resources exhausted: {reason}")]
    ResourceExhausted {
        /// Reason for failure
        reason: String,
    },

    /// Pending-request limit reached
    #[error("Request queue full ({limit} pending)")]
    QueueFull {
        /// Configured limit
        limit: usize,
    },

    /// Hardware requested but no device is open
    #[error("No device available")]
    DeviceNotAvailable,

    /// Request still running when the wait expired
    #[error("Request {request} still running")]
    Busy {
        /// Request that can be waited on again
        request: u32,
    },

    /// Driver boundary failure
    #[error("Driver error: {source}")]
    Driver {
        /// Underlying driver error
        #[from]
        source: DriverError,
    },

    /// Operation or data mode not supported by the chosen target
    #[error("Unsupported operation: {reason}")]
    UnsupportedOperation {
        /// Reason for failure
        reason: String,
    },

    /// Model failed validation
    #[error("Invalid model: {reason}")]
    InvalidModel {
        /// Reason for failure
        reason: String,
    },

    /// Failure attributed to one layer
    #[error("Layer {index}: {source}")]
    Layer {
        /// Index of the offending layer
        index: usize,
        /// What went wrong
        #[source]
        source: Box<GnaError>,
    },

    /// Buffer range outside any known allocation
    #[error("Memory out of bounds: {reason}")]
    MemoryOutOfBounds {
        /// Reason for failure
        reason: String,
    },

    /// Memory still referenced
    #[error("Memory at {address:#x} still in use")]
    MemoryInUse {
        /// Address of the allocation
        address: usize,
    },

    /// Thread count outside the accepted range
    #[error("Invalid thread count {count} (accepted 1..={max})")]
    InvalidThreadCount {
        /// Requested count
        count: usize,
        /// Upper bound
        max: usize,
    },

    /// Acceleration mode not available
    #[error("Acceleration mode {mode} not supported on this host")]
    AccelerationModeNotSupported {
        /// Requested mode
        mode: String,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason for failure
        reason: String,
    },

    /// A worker panicked while executing a request
    #[error("Request execution panicked: {message}")]
    ExecutionPanicked {
        /// Panic payload, if it was a string
        message: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl GnaError {
    /// Create an invalid identifier error
    pub fn invalid_identifier(kind: &'static str, id: impl Into<u64>) -> Self {
        Self::InvalidIdentifier {
            kind,
            id: id.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            reason: reason.into(),
        }
    }

    /// Create an invalid model error
    pub fn invalid_model(reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            reason: reason.into(),
        }
    }

    /// Create a memory out of bounds error
    pub fn out_of_bounds(reason: impl Into<String>) -> Self {
        Self::MemoryOutOfBounds {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Attribute this error to a layer. Already attributed errors keep
    /// their original index.
    #[must_use]
    pub fn in_layer(self, index: usize) -> Self {
        match self {
            Self::Layer { .. } => self,
            other => Self::Layer {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Index of the layer this error is attributed to.
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            Self::Layer { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Status code of this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidIdentifier { .. } => Status::ErrorIdentifierInvalid,
            Self::ResourceExhausted { .. } => Status::ErrorResourceExhausted,
            Self::QueueFull { .. } => Status::ErrorQueueFull,
            Self::DeviceNotAvailable => Status::ErrorDeviceNotAvailable,
            Self::Busy { .. } => Status::WarningDeviceBusy,
            Self::Driver { source } => driver_status(source),
            Self::UnsupportedOperation { .. } => Status::ErrorUnsupportedOperation,
            Self::InvalidModel { .. } => Status::ErrorModelInvalid,
            Self::Layer { source, .. } => source.status(),
            Self::MemoryOutOfBounds { .. } => Status::ErrorMemoryOutOfBounds,
            Self::MemoryInUse { .. } => Status::ErrorMemoryInUse,
            Self::InvalidThreadCount { .. } => Status::ErrorInvalidThreadCount,
            Self::AccelerationModeNotSupported { .. } => {
                Status::ErrorAccelerationModeNotSupported
            }
            Self::InvalidConfiguration { .. } => Status::ErrorInvalidConfiguration,
            Self::ExecutionPanicked { .. } | Self::Io { .. } => Status::ErrorUnknown,
        }
    }
}

fn driver_status(error: &DriverError) -> Status {
    match error {
        DriverError::DeviceNotFound { .. }
        | DriverError::NoDevicesFound
        | DriverError::InvalidIndex { .. } => Status::ErrorDeviceNotAvailable,
        DriverError::Busy | DriverError::Timeout { .. } => Status::ErrorDeviceCriticalFailure,
        DriverError::UnknownMemoryId { .. } => Status::ErrorIdentifierInvalid,
        DriverError::ForbiddenMemoryId => Status::ErrorResourceExhausted,
        DriverError::Hardware { fault, .. } => match fault {
            HardwareFault::MmuError => Status::ErrorDeviceMmu,
            HardwareFault::DmaError => Status::ErrorDeviceDma,
            HardwareFault::UnexpectedCompletion => Status::ErrorDeviceUnexpectedCompletion,
            HardwareFault::VirtualAddressOutOfRange => Status::ErrorDeviceVaOutOfRange,
            HardwareFault::ParameterOutOfRange => Status::ErrorDeviceParamOutOfRange,
            HardwareFault::Incomplete => Status::ErrorDeviceCriticalFailure,
        },
        DriverError::Io { .. }
        | DriverError::MapFailed { .. }
        | DriverError::SubmitFailed { .. }
        | DriverError::CapabilityQueryFailed { .. }
        | DriverError::InvalidPayload { .. } => Status::ErrorDeviceIoctl,
    }
}
