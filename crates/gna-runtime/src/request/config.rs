//! Request configurations
//!
//! A configuration belongs to one model and holds what varies between
//! requests: per-layer input and output buffers, active lists, the
//! acceleration preference and optional instrumentation. Every mutation
//! bumps [`RequestConfiguration::generation`], which is how cached
//! hardware requests notice they are stale.

use std::collections::BTreeMap;
use std::fmt;

use gna_chip::DeviceVersion;

use crate::cpu::ExecutionPolicy;
use crate::error::{GnaError, Result};
use crate::memory::BufferRef;
use crate::model::{Layer, ModelId, Operand};
use crate::profiler::InstrumentationConfig;

/// Request configuration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(pub(crate) u32);

impl ConfigId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config#{}", self.0)
    }
}

/// Output indices a layer computes.
#[derive(Debug, Clone)]
pub struct ActiveList {
    /// `count` little-endian `u32` indices
    pub buffer: BufferRef,
    /// Number of indices
    pub count: usize,
}

/// Per-layer overrides.
#[derive(Debug, Clone, Default)]
pub struct LayerConfiguration {
    /// Input buffer
    pub input: Option<BufferRef>,
    /// Output buffer
    pub output: Option<BufferRef>,
    /// Active list
    pub active_list: Option<ActiveList>,
}

/// Bindings and preferences of a family of requests.
#[derive(Debug, Clone)]
pub struct RequestConfiguration {
    id: ConfigId,
    model: ModelId,
    layers: BTreeMap<usize, LayerConfiguration>,
    policy: ExecutionPolicy,
    consistency: Option<DeviceVersion>,
    instrumentation: Option<InstrumentationConfig>,
    generation: u64,
}

impl RequestConfiguration {
    pub(crate) fn new(id: ConfigId, model: ModelId, policy: ExecutionPolicy) -> Self {
        Self {
            id,
            model,
            layers: BTreeMap::new(),
            policy,
            consistency: None,
            instrumentation: None,
            generation: 0,
        }
    }

    /// Handle.
    #[must_use]
    pub const fn id(&self) -> ConfigId {
        self.id
    }

    /// Model the configuration belongs to.
    #[must_use]
    pub const fn model(&self) -> ModelId {
        self.model
    }

    /// Mutation counter.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn layer(&self, index: usize) -> Option<&LayerConfiguration> {
        self.layers.get(&index)
    }

    /// Every configured layer.
    pub fn layers(&self) -> impl Iterator<Item = (usize, &LayerConfiguration)> {
        self.layers.iter().map(|(&i, c)| (i, c))
    }

    /// Policy resolved from the preference.
    #[must_use]
    pub const fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    /// Generation whose results software execution must reproduce.
    #[must_use]
    pub const fn consistency(&self) -> Option<DeviceVersion> {
        self.consistency
    }

    /// Instrumentation, if attached.
    #[must_use]
    pub const fn instrumentation(&self) -> Option<&InstrumentationConfig> {
        self.instrumentation.as_ref()
    }

    /// Input of `layer` for this configuration: the override, else the
    /// buffer bound in the model.
    #[must_use]
    pub fn input_of<'a>(&'a self, layer: &'a Layer) -> Option<&'a BufferRef> {
        self.layer(layer.index)
            .and_then(|c| c.input.as_ref())
            .or(layer.input.bound.as_ref())
    }

    /// Output of `layer` for this configuration.
    #[must_use]
    pub fn output_of<'a>(&'a self, layer: &'a Layer) -> Option<&'a BufferRef> {
        self.layer(layer.index)
            .and_then(|c| c.output.as_ref())
            .or(layer.output.bound.as_ref())
    }

    /// Active list of a layer.
    #[must_use]
    pub fn active_list(&self, index: usize) -> Option<&ActiveList> {
        self.layer(index).and_then(|c| c.active_list.as_ref())
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    /// Bind an input or output buffer.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidConfiguration` for other operands and
    /// `GnaError::MemoryOutOfBounds` if the buffer is smaller than the
    /// layer's tensor.
    pub fn set_buffer(&mut self, layer: &Layer, operand: Operand, buffer: BufferRef) -> Result<()> {
        let expected = match operand {
            Operand::Input => layer.input.len,
            Operand::Output => layer.output.len,
            other => {
                return Err(GnaError::invalid_configuration(format!(
                    "{other:?} buffers are fixed in the model"
                )))
            }
        };
        if buffer.len() < expected {
            return Err(GnaError::out_of_bounds(format!(
                "layer {} {operand:?} needs {expected} bytes, buffer has {}",
                layer.index,
                buffer.len()
            )));
        }
        let entry = self.layers.entry(layer.index).or_default();
        if operand == Operand::Input {
            entry.input = Some(buffer);
        } else {
            entry.output = Some(buffer);
        }
        self.touch();
        Ok(())
    }

    /// Restrict a layer to `count` outputs listed in `buffer`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::UnsupportedOperation` for layers without active
    /// list support and `GnaError::InvalidConfiguration` for a count outside
    /// `1..=outputs`.
    pub fn set_active_list(&mut self, layer: &Layer, buffer: BufferRef, count: usize) -> Result<()> {
        if !layer.kind.accepts_active_list() {
            return Err(GnaError::unsupported(format!(
                "{} layers take no active list",
                layer.kind
            )));
        }
        if count == 0 || count > layer.shape.outputs {
            return Err(GnaError::invalid_configuration(format!(
                "active list of {count} for {} outputs",
                layer.shape.outputs
            )));
        }
        if buffer.len() < count * 4 {
            return Err(GnaError::out_of_bounds("active list buffer too small"));
        }
        self.layers.entry(layer.index).or_default().active_list = Some(ActiveList {
            buffer: buffer.with_len(count * 4),
            count,
        });
        self.touch();
        Ok(())
    }

    /// Change the execution policy.
    pub fn set_policy(&mut self, policy: ExecutionPolicy) {
        self.policy = policy;
        self.touch();
    }

    /// Force software execution consistent with `version`.
    pub fn set_consistency(&mut self, version: DeviceVersion, policy: ExecutionPolicy) {
        self.consistency = Some(version);
        self.policy = policy;
        self.touch();
    }

    /// Attach or detach instrumentation.
    pub fn set_instrumentation(&mut self, instrumentation: Option<InstrumentationConfig>) {
        self.instrumentation = instrumentation;
        self.touch();
    }
}
