//! Model partitioning
//!
//! Splits a model's layers into maximal contiguous runs that execute on one
//! target. A new run starts when the target changes, before every legacy
//! GMM layer (the device scores those one at a time), and when a hardware
//! run reaches the device's layer limit.
//!
//! ```text
//! layers:  [affine i16] [affine i8] [affine i16]      on GNA 2.0
//! runs:    Hardware(0,1) Software(1,1) Hardware(2,1)
//! ```

use std::ops::Range;

use gna_chip::{DeviceVersion, HardwareCapabilities, Support};

use crate::model::Layer;

/// Where a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubModelKind {
    /// Host kernels
    Software,
    /// Device, through the xNN descriptor stream
    Hardware,
    /// Device, through a legacy GMM descriptor
    GmmHardware,
}

/// Contiguous run of layers on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubModel {
    /// Target
    pub kind: SubModelKind,
    /// First layer
    pub layer_index: usize,
    /// Number of layers
    pub layer_count: usize,
}

impl SubModel {
    /// Layer indices of the run.
    #[must_use]
    pub const fn layers(&self) -> Range<usize> {
        self.layer_index..self.layer_index + self.layer_count
    }
}

/// What partitioning may assume about hardware.
///
/// `target` is the generation whose capabilities decide eligibility;
/// `device` is the generation actually present, `None` for software-only
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityTable {
    /// Generation compiled for
    pub target: DeviceVersion,
    /// Generation available at run time
    pub device: Option<DeviceVersion>,
}

impl CapabilityTable {
    /// Execution on a present device of the target generation.
    #[must_use]
    pub const fn hardware(version: DeviceVersion) -> Self {
        Self {
            target: version,
            device: Some(version),
        }
    }

    /// Software-only execution emulating `target`.
    #[must_use]
    pub const fn software(target: DeviceVersion) -> Self {
        Self {
            target,
            device: None,
        }
    }

    /// Target of one layer.
    #[must_use]
    pub fn classify(&self, layer: &Layer) -> SubModelKind {
        let target = HardwareCapabilities::for_version(self.target).support(layer.kind, layer.mode);
        if !target.is_supported() {
            return SubModelKind::Software;
        }
        let Some(device) = self.device else {
            return SubModelKind::Software;
        };
        match HardwareCapabilities::for_version(device).support(layer.kind, layer.mode) {
            Support::Native => SubModelKind::Hardware,
            Support::LegacyGmm => SubModelKind::GmmHardware,
            Support::Unsupported => SubModelKind::Software,
        }
    }

    fn max_hardware_layers(&self) -> usize {
        self.device
            .map_or(usize::MAX, |d| HardwareCapabilities::for_version(d).max_layer_count)
    }
}

/// Split `layers` into runs.
#[must_use]
pub fn partition(layers: &[Layer], table: &CapabilityTable) -> Vec<SubModel> {
    let max_hardware = table.max_hardware_layers();
    let mut runs: Vec<SubModel> = Vec::new();

    for layer in layers {
        let kind = table.classify(layer);
        match runs.last_mut() {
            Some(run)
                if run.kind == kind
                    && kind != SubModelKind::GmmHardware
                    && !(kind == SubModelKind::Hardware && run.layer_count >= max_hardware) =>
            {
                run.layer_count += 1;
            }
            _ => runs.push(SubModel {
                kind,
                layer_index: layer.index,
                layer_count: 1,
            }),
        }
    }

    debug_assert!(covers(&runs, layers.len()), "partition must cover every layer once");
    tracing::debug!(
        "Partitioned {} layers for {} (device {:?}) into {} runs",
        layers.len(),
        table.target,
        table.device,
        runs.len()
    );
    runs
}

/// Whether `runs` cover `0..layer_count` exactly once, in order.
#[must_use]
pub fn covers(runs: &[SubModel], layer_count: usize) -> bool {
    let mut next = 0;
    for run in runs {
        if run.layer_index != next || run.layer_count == 0 {
            return false;
        }
        next += run.layer_count;
    }
    next == layer_count
}
