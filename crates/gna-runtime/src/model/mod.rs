//! Models
//!
//! A [`ModelDescription`] is what callers build; [`CompiledModel`] is what
//! the device keeps after validation: compiled layers, the memory they
//! reference, memoized partitions and, when a device is open, the
//! hardware descriptors.

mod compiled;
mod layer;
mod operation;

use std::fmt;

pub use compiled::CompiledModel;
pub use layer::{Activation, Layer, LayerBuffer, MAX_PWL_SEGMENTS, MAX_VECTORS};
pub use operation::{
    ModelDescription, Operand, Operation, Parameters, Pooling, PoolingKind, Tensor,
};

/// Model handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) u32);

impl ModelId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}
