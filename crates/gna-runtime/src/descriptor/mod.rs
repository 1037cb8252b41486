//! Descriptor compilation
//!
//! Every hardware-eligible layer becomes one fixed-size record in the
//! descriptor area. Slots are reserved for software layers too, so a
//! layer's slot is always `index * XNN_DESCRIPTOR_SIZE`.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────┐
//! │ slot 0   │ slot 1   │ slot 2   │ GMM records │  (legacy GMM only)
//! └──────────┴──────────┴──────────┴─────────────┘
//! ```
//!
//! Buffer fields hold device offsets resolved through the model's memory
//! container, in which the descriptor area itself comes first.

mod arena;
mod layer;

pub use arena::DescriptorArena;
pub use layer::{IterationPlan, Slot, MAX_ITERATIONS};

pub(crate) use layer::LayerWriter;
