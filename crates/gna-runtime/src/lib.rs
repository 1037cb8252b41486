//! Host runtime for the GNA (Gaussian & Neural Accelerator) scoring engine.
//!
//! Models are compiled once into validated layers, partitioned into runs
//! that execute on the device or in host kernels, and scored through
//! request configurations that bind per-request buffers.
//!
//! ```text
//! ModelDescription ──compile──► CompiledModel ──partition──► [SubModel]
//!                                     │                         │
//!                               HardwareModel              software kernels
//!                               (descriptors)                   │
//!                                     │                         │
//! RequestConfiguration ──enqueue──► worker pool ──► driver / kernels ──► wait
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use gna_chip::DataWidth;
//! use gna_runtime::{Device, ModelDescription, Operand, Operation, RuntimeConfig, Tensor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Device::open(RuntimeConfig::from_env()?)?;
//! let memory = device.allocate_memory(4096)?;
//! let model = device.create_model(&ModelDescription::new(vec![Operation::affine(
//!     Tensor::new(&[1, 8], DataWidth::Int16),
//!     Tensor::new(&[1, 4], DataWidth::Int32),
//!     Tensor::new(&[4, 8], DataWidth::Int16).at(memory),
//!     Tensor::new(&[4], DataWidth::Int32).at(memory + 64),
//! )]))?;
//! let config = device.create_request_config(model)?;
//! device.set_operand_buffer(config, 0, Operand::Input, memory + 128)?;
//! device.set_operand_buffer(config, 0, Operand::Output, memory + 256)?;
//! let request = device.enqueue(config)?;
//! let outcome = device.wait(request, None)?;
//! println!("{}: {:?}", outcome.status, device.read(memory + 256, 16)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod cpu;
pub mod descriptor;
mod device;
mod error;
pub mod export;
pub mod hardware_model;
pub mod kernels;
pub mod memory;
pub mod model;
pub mod partition;
pub mod pool;
pub mod profiler;
pub mod request;
pub mod software;

pub use config::RuntimeConfig;
pub use cpu::{AccelerationMode, CpuFeatures, ExecutionPolicy, HardwareUse, KernelMode, SoftwareModes};
pub use device::{Device, DEFAULT_EMULATED_VERSION};
pub use error::{GnaError, Result, Status};
pub use export::ExportedModel;
pub use hardware_model::{HardwareModel, HardwareTarget};
pub use model::{
    CompiledModel, ModelDescription, ModelId, Operand, Operation, Parameters, Pooling,
    PoolingKind, Tensor,
};
pub use partition::{CapabilityTable, SubModel, SubModelKind};
pub use profiler::{InstrumentationConfig, InstrumentationPoint, ProfileReport, TimeUnit};
pub use request::{ConfigId, RequestConfiguration, RequestId, RequestOutcome, RequestState};
