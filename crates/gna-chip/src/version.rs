//! Hardware generations.
//!
//! The driver reports a raw version code; every table in this crate is keyed
//! by the decoded [`DeviceVersion`].

use std::fmt;

/// Accelerator generation.
///
/// The discriminants are the raw codes reported by the driver's
/// device-version parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceVersion {
    /// GMM-only scoring block (0.9). Scores Gaussian mixtures through the
    /// legacy GMM descriptor, nothing else.
    Gmm,
    /// GNA 1.0. First xNN generation, GMM still through legacy descriptors.
    Gna1_0,
    /// GNA 2.0. GMM folded into the xNN descriptor stream.
    Gna2_0,
    /// GNA 3.0. Adds 8-bit inputs and narrower biases.
    Gna3_0,
    /// GNA 3.5.
    Gna3_5,
    /// Embedded GNA 1.0 (no GMM block).
    Embedded1_0,
    /// Embedded GNA 3.0.
    Embedded3_0,
    /// Embedded GNA 3.1.
    Embedded3_1,
}

impl DeviceVersion {
    /// Every known generation, oldest first.
    pub const ALL: [Self; 8] = [
        Self::Gmm,
        Self::Gna1_0,
        Self::Gna2_0,
        Self::Gna3_0,
        Self::Gna3_5,
        Self::Embedded1_0,
        Self::Embedded3_0,
        Self::Embedded3_1,
    ];

    /// Raw version code as reported by the driver.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Gmm => 0x01,
            Self::Gna1_0 => 0x10,
            Self::Gna2_0 => 0x20,
            Self::Gna3_0 => 0x30,
            Self::Gna3_5 => 0x35,
            Self::Embedded1_0 => 0x10E,
            Self::Embedded3_0 => 0x30E,
            Self::Embedded3_1 => 0x31E,
        }
    }

    /// Decode a raw version code.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x01 | 0x09 => Some(Self::Gmm),
            0x10 => Some(Self::Gna1_0),
            0x20 => Some(Self::Gna2_0),
            0x30 => Some(Self::Gna3_0),
            0x35 => Some(Self::Gna3_5),
            0x10E => Some(Self::Embedded1_0),
            0x30E => Some(Self::Embedded3_0),
            0x31E => Some(Self::Embedded3_1),
            _ => None,
        }
    }

    /// Embedded parts are only reachable through model export.
    #[must_use]
    pub const fn is_embedded(self) -> bool {
        matches!(
            self,
            Self::Embedded1_0 | Self::Embedded3_0 | Self::Embedded3_1
        )
    }

    /// Generations of the 3.x family share the extended descriptor layout.
    #[must_use]
    pub const fn has_precision_flags(self) -> bool {
        matches!(
            self,
            Self::Gna3_0 | Self::Gna3_5 | Self::Embedded3_0 | Self::Embedded3_1
        )
    }

    /// Parse a short generation name: `0.9`, `1.0`, `2.0`, `3.0`, `3.5`,
    /// or an embedded part with an `e` suffix (`1.0e`, `3.0e`, `3.1e`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "0.9" | "gmm" => Self::Gmm,
            "1.0" => Self::Gna1_0,
            "2.0" => Self::Gna2_0,
            "3.0" => Self::Gna3_0,
            "3.5" => Self::Gna3_5,
            "1.0e" => Self::Embedded1_0,
            "3.0e" => Self::Embedded3_0,
            "3.1e" => Self::Embedded3_1,
            _ => return None,
        })
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gmm => "GMM 0.9",
            Self::Gna1_0 => "GNA 1.0",
            Self::Gna2_0 => "GNA 2.0",
            Self::Gna3_0 => "GNA 3.0",
            Self::Gna3_5 => "GNA 3.5",
            Self::Embedded1_0 => "GNA 1.0 embedded",
            Self::Embedded3_0 => "GNA 3.0 embedded",
            Self::Embedded3_1 => "GNA 3.1 embedded",
        };
        f.write_str(name)
    }
}
