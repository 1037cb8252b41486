//! Driver abstraction
//!
//! One trait covers everything the runtime needs from a driver: query
//! capabilities, map and unmap host memory, and submit a scoring record.
//! Implementations exist for the Linux kernel driver and for an in-process
//! simulated device.

use std::fmt::Debug;
use std::time::Instant;

use crate::capabilities::DriverCapabilities;
use crate::error::Result;
use crate::status::Completion;

/// Identifier of a driver memory mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(u64);

impl MemoryId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// Host allocation handed to the driver for mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBuffer {
    /// User-space address of the first byte.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Hardware performance counters of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwarePerf {
    /// Total cycles spent scoring.
    pub total: u64,
    /// Cycles stalled on memory.
    pub stall: u64,
}

/// Driver-side timestamps of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPerf {
    /// Host time right before the submit call.
    pub ioctl_submit: Instant,
    /// Host time right after the wait call returned.
    pub ioctl_return: Instant,
    /// Driver timestamp when the device was started.
    pub start_hw: u64,
    /// Driver timestamp when the completion interrupt arrived.
    pub complete_hw: u64,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitResult {
    /// Success or saturation warning.
    pub completion: Completion,
    /// Hardware counters.
    pub hardware_perf: HardwarePerf,
    /// Driver timestamps.
    pub driver_perf: DriverPerf,
}

/// Driver boundary trait.
///
/// All methods take `&self`: worker threads submit concurrently through a
/// shared handle.
pub trait DriverInterface: Debug + Send + Sync {
    /// Capabilities queried when the device was opened.
    fn capabilities(&self) -> &DriverCapabilities;

    /// Map a host allocation for device access.
    ///
    /// Blocks until the driver confirms the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping is refused, never confirmed within
    /// the recovery timeout, or the driver returns the forbidden identifier.
    fn map_memory(&self, buffer: HostBuffer) -> Result<MemoryId>;

    /// Release a mapping.
    ///
    /// Waits for the unmap acknowledgement and for any still-pending map
    /// acknowledgement of the same id. Callers must not unmap a buffer
    /// referenced by an outstanding submission.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is unknown or the driver refuses.
    fn unmap_memory(&self, id: MemoryId) -> Result<()>;

    /// Submit an encoded [`Submission`](crate::protocol::Submission) and
    /// wait for completion.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Hardware`](crate::DriverError::Hardware) for
    /// fatal status bits, `Busy`/`Timeout` for transient conditions, and
    /// other variants for rejected payloads.
    fn submit(&self, payload: &[u8]) -> Result<SubmitResult>;

    /// Backend type for diagnostics.
    fn driver_type(&self) -> DriverType;
}

/// Driver backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    /// Linux kernel driver (/dev/gna*)
    Kernel,

    /// In-process simulated device
    Simulated,
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel => write!(f, "Kernel"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Driver selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverSelection {
    /// Use the kernel driver if a device is present
    Auto,

    /// Force the kernel driver
    Kernel,

    /// Simulated device of the given generation
    Simulated(gna_chip::DeviceVersion),
}

/// Open a driver according to `selection`.
///
/// # Errors
///
/// Returns an error if no suitable backend can be opened for `index`.
pub fn select_driver(selection: DriverSelection, index: usize) -> Result<Box<dyn DriverInterface>> {
    use crate::backends::kernel::KernelDriver;
    use crate::backends::simulated::SimulatedDriver;

    match selection {
        DriverSelection::Auto | DriverSelection::Kernel => {
            let driver = KernelDriver::open(index)?;
            tracing::info!("Using kernel driver for device {index}");
            Ok(Box::new(driver))
        }
        DriverSelection::Simulated(version) => {
            tracing::info!("Using simulated {version} device");
            Ok(Box::new(SimulatedDriver::new(version)))
        }
    }
}
