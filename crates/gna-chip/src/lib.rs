//! Silicon model for the GNA (Gaussian & Neural Accelerator) scoring engine.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the silicon and of the driver wire format: hardware
//! generations, PCI identifiers, per-generation capability tables, the
//! binary layer-descriptor layouts and the submission record constants.
//!
//! Everything that must stay bit-exact with the kernel driver lives here so
//! the host runtime and the driver boundary read from a single table.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`version`] | Hardware generations and raw version codes |
//! | [`pcie`] | Vendor/device IDs and the device-id → generation map |
//! | [`operation`] | Hardware operations, data widths, descriptor opcodes |
//! | [`capability`] | Per-generation eligibility, run-length and buffer limits |
//! | [`descriptor`] | xNN / GMM descriptor field layouts per generation |
//! | [`status`] | Hardware status register bits |
//! | [`protocol`] | Submission / wait record layout shared with the driver |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capability;
pub mod descriptor;
pub mod operation;
pub mod pcie;
pub mod protocol;
pub mod status;
pub mod version;

pub use capability::{HardwareCapabilities, Support};
pub use descriptor::{
    DescriptorLayout, FieldError, FieldKind, FieldLocation, GmmField, GmmPlacement, XnnField,
};
pub use operation::{DataMode, DataWidth, HwOperation, NnOpCode};
pub use version::DeviceVersion;
