//! Driver boundary for the GNA scoring accelerator.
//!
//! Everything the host runtime needs from the kernel driver sits behind
//! [`DriverInterface`]: map a host allocation, unmap it, submit one scoring
//! record and wait for its status. The record itself is built with
//! [`protocol::Submission`] and encoded bit-exactly.
//!
//! # Backends
//!
//! ```text
//! KernelDriver     /dev/gnaN IOCTLs (Linux)
//! SimulatedDriver  in-process device for CI, validates every record
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use gna_driver::{select_driver, DriverSelection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = select_driver(DriverSelection::Auto, 0)?;
//! let caps = driver.capabilities();
//! println!("{}: {} KiB input buffer, submit timeout {:?}",
//!          caps.device_version, caps.buffer_size_kb, caps.submit_timeout());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod capabilities;
mod discovery;
mod error;
mod interface;
pub mod protocol;
mod status;
pub mod tracker;

pub use backends::kernel::KernelDriver;
pub use backends::simulated::SimulatedDriver;
pub use capabilities::DriverCapabilities;
pub use discovery::{DeviceInfo, DeviceManager};
pub use error::{DriverError, Result};
pub use interface::{
    select_driver, DriverInterface, DriverPerf, DriverSelection, DriverType, HardwarePerf,
    HostBuffer, MemoryId, SubmitResult,
};
pub use status::{Completion, HardwareFault, HardwareStatus};
