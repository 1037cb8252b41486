//! PCI identifiers.
//!
//! The accelerator is an integrated PCI function on the host SoC; the
//! device id alone determines the generation.

use crate::version::DeviceVersion;

/// Intel vendor ID (PCI-SIG assigned).
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Device IDs by platform.
pub mod device_id {
    /// Cannon Lake.
    pub const CNL: u16 = 0x5A11;
    /// Gemini Lake.
    pub const GLK: u16 = 0x3190;
    /// Ice Lake.
    pub const ICL: u16 = 0x8A11;
    /// Elkhart Lake.
    pub const EHL: u16 = 0x4511;
    /// Jasper Lake.
    pub const JSL: u16 = 0x4E11;
    /// Tiger Lake.
    pub const TGL: u16 = 0x9A11;
    /// Alder Lake.
    pub const ADL: u16 = 0x464F;
    /// Raptor Lake.
    pub const RPL: u16 = 0xA74F;
    /// Meteor Lake.
    pub const MTL: u16 = 0x7E4C;
}

/// Device id → generation.
pub const DEVICE_GENERATIONS: &[(u16, DeviceVersion)] = &[
    (device_id::CNL, DeviceVersion::Gna1_0),
    (device_id::GLK, DeviceVersion::Gna1_0),
    (device_id::ICL, DeviceVersion::Gna1_0),
    (device_id::EHL, DeviceVersion::Gna2_0),
    (device_id::JSL, DeviceVersion::Gna2_0),
    (device_id::TGL, DeviceVersion::Gna2_0),
    (device_id::ADL, DeviceVersion::Gna3_0),
    (device_id::RPL, DeviceVersion::Gna3_0),
    (device_id::MTL, DeviceVersion::Gna3_5),
];

/// All known device IDs.
#[must_use]
pub fn all_device_ids() -> impl Iterator<Item = u16> {
    DEVICE_GENERATIONS.iter().map(|(id, _)| *id)
}

/// Generation of a device id, if known.
#[must_use]
pub fn generation_of(device_id: u16) -> Option<DeviceVersion> {
    DEVICE_GENERATIONS
        .iter()
        .find(|(id, _)| *id == device_id)
        .map(|(_, version)| *version)
}
