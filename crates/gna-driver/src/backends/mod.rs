//! Driver backends
//!
//! | Backend | Transport |
//! |---------|-----------|
//! | [`kernel::KernelDriver`] | `/dev/gnaN` IOCTLs |
//! | [`simulated::SimulatedDriver`] | in-process, no hardware |

pub mod kernel;
pub mod simulated;
