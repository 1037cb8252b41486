//! Host capability detection and acceleration-mode resolution
//!
//! Probes the CPU once for the vector extensions the software kernels can
//! use, then resolves the caller's [`AccelerationMode`] preference through
//! an explicit alias table.

use std::fmt;

use crate::error::{GnaError, Result};

/// Software kernel family, slowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelMode {
    /// Portable scalar kernels
    Generic,
    /// SSE4.2 kernels
    Sse4_2,
    /// AVX kernels
    Avx1,
    /// AVX2 kernels
    Avx2,
}

impl KernelMode {
    /// Every kernel mode, slowest first.
    pub const ALL: [Self; 4] = [Self::Generic, Self::Sse4_2, Self::Avx1, Self::Avx2];

    /// Position in [`KernelMode::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Generic => "generic",
            Self::Sse4_2 => "sse4.2",
            Self::Avx1 => "avx1",
            Self::Avx2 => "avx2",
        })
    }
}

/// Raw CPU feature flags relevant to kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    /// SSE4.2 present
    pub sse4_2: bool,
    /// AVX present
    pub avx: bool,
    /// OS saves the wide register state across context switches
    pub os_wide_registers: bool,
    /// AVX2 present
    pub avx2: bool,
}

impl CpuFeatures {
    /// Probe the running CPU.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[must_use]
    pub fn detect() -> Self {
        Self {
            sse4_2: std::is_x86_feature_detected!("sse4.2"),
            avx: std::is_x86_feature_detected!("avx"),
            os_wide_registers: std::is_x86_feature_detected!("xsave"),
            avx2: std::is_x86_feature_detected!("avx2"),
        }
    }

    /// Probe the running CPU. Non-x86 hosts only run generic kernels.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    #[must_use]
    pub fn detect() -> Self {
        Self::default()
    }
}

/// Kernel modes usable on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareModes {
    available: [bool; 4],
}

impl SoftwareModes {
    /// Detect the modes of the running host.
    #[must_use]
    pub fn detect() -> Self {
        let modes = Self::from_features(CpuFeatures::detect());
        tracing::info!(
            "Software kernels: {}",
            modes
                .supported()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        modes
    }

    /// Modes implied by a feature set.
    ///
    /// Generic is always available. AVX1 additionally needs the OS to save
    /// wide registers; AVX2 builds on AVX1.
    #[must_use]
    pub const fn from_features(features: CpuFeatures) -> Self {
        let avx1 = features.avx && features.os_wide_registers;
        let avx2 = avx1 && features.avx2;
        Self {
            available: [true, features.sse4_2, avx1, avx2],
        }
    }

    /// Generic kernels only.
    #[must_use]
    pub const fn generic_only() -> Self {
        Self {
            available: [true, false, false, false],
        }
    }

    /// Whether `mode` runs on this host.
    #[must_use]
    pub const fn is_supported(&self, mode: KernelMode) -> bool {
        self.available[mode.index()]
    }

    /// Supported modes, slowest first.
    #[must_use]
    pub fn supported(&self) -> Vec<KernelMode> {
        KernelMode::ALL
            .into_iter()
            .filter(|mode| self.is_supported(*mode))
            .collect()
    }

    /// Fastest supported mode.
    #[must_use]
    pub fn fastest(&self) -> KernelMode {
        KernelMode::ALL
            .into_iter()
            .rev()
            .find(|mode| self.is_supported(*mode))
            .unwrap_or(KernelMode::Generic)
    }

    /// Resolve a preference into an execution policy.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::AccelerationModeNotSupported` if the preference
    /// names a kernel mode this host lacks.
    pub fn resolve(&self, mode: AccelerationMode) -> Result<ExecutionPolicy> {
        let alias = alias_of(mode);
        let kernel = match alias.kernel {
            KernelChoice::Fastest => self.fastest(),
            KernelChoice::Exact(kernel) if self.is_supported(kernel) => kernel,
            KernelChoice::Exact(_) => {
                return Err(GnaError::AccelerationModeNotSupported {
                    mode: mode.to_string(),
                })
            }
        };
        Ok(ExecutionPolicy {
            hardware: alias.hardware,
            kernel,
            consistent: alias.consistent,
        })
    }
}

/// Caller preference for where and how a request executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccelerationMode {
    /// Hardware when present, fastest software kernels otherwise
    #[default]
    Auto,
    /// Like `Auto`, with hardware-consistent software arithmetic
    AutoConsistent,
    /// Like `Auto`, with fast software arithmetic
    AutoFast,
    /// Software only, fastest kernels
    Software,
    /// Hardware required
    Hardware,
    /// Software only, generic kernels
    Generic,
    /// Software only, SSE4.2 kernels
    Sse4_2,
    /// Software only, AVX kernels
    Avx1,
    /// Software only, AVX2 kernels
    Avx2,
}

impl fmt::Display for AccelerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::AutoConsistent => "auto-consistent",
            Self::AutoFast => "auto-fast",
            Self::Software => "software",
            Self::Hardware => "hardware",
            Self::Generic => "generic",
            Self::Sse4_2 => "sse4.2",
            Self::Avx1 => "avx1",
            Self::Avx2 => "avx2",
        })
    }
}

/// Whether hardware may run a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareUse {
    /// Software only
    Never,
    /// Hardware-capable layers go to the device when one is open
    IfAvailable,
    /// Fail the request when no device is open
    Required,
}

#[derive(Debug, Clone, Copy)]
enum KernelChoice {
    Fastest,
    Exact(KernelMode),
}

#[derive(Debug, Clone, Copy)]
struct Alias {
    mode: AccelerationMode,
    hardware: HardwareUse,
    kernel: KernelChoice,
    consistent: bool,
}

// ── Alias table ──────────────────────────────────────────────────────────────

const ALIASES: [Alias; 9] = [
    Alias {
        mode: AccelerationMode::Auto,
        hardware: HardwareUse::IfAvailable,
        kernel: KernelChoice::Fastest,
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::AutoConsistent,
        hardware: HardwareUse::IfAvailable,
        kernel: KernelChoice::Fastest,
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::AutoFast,
        hardware: HardwareUse::IfAvailable,
        kernel: KernelChoice::Fastest,
        consistent: false,
    },
    Alias {
        mode: AccelerationMode::Software,
        hardware: HardwareUse::Never,
        kernel: KernelChoice::Fastest,
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::Hardware,
        hardware: HardwareUse::Required,
        kernel: KernelChoice::Fastest,
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::Generic,
        hardware: HardwareUse::Never,
        kernel: KernelChoice::Exact(KernelMode::Generic),
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::Sse4_2,
        hardware: HardwareUse::Never,
        kernel: KernelChoice::Exact(KernelMode::Sse4_2),
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::Avx1,
        hardware: HardwareUse::Never,
        kernel: KernelChoice::Exact(KernelMode::Avx1),
        consistent: true,
    },
    Alias {
        mode: AccelerationMode::Avx2,
        hardware: HardwareUse::Never,
        kernel: KernelChoice::Exact(KernelMode::Avx2),
        consistent: true,
    },
];

fn alias_of(mode: AccelerationMode) -> Alias {
    ALIASES
        .iter()
        .copied()
        .find(|alias| alias.mode == mode)
        .unwrap_or(ALIASES[0])
}

/// Resolved execution choice of a request configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Hardware use
    pub hardware: HardwareUse,
    /// Kernel family for software layers
    pub kernel: KernelMode,
    /// Hardware-consistent arithmetic in software layers
    pub consistent: bool,
}

impl ExecutionPolicy {
    /// Software-only policy with consistent arithmetic, used when a
    /// configuration asks for bit-exact emulation of a generation.
    #[must_use]
    pub const fn consistent_software(kernel: KernelMode) -> Self {
        Self {
            hardware: HardwareUse::Never,
            kernel,
            consistent: true,
        }
    }
}
