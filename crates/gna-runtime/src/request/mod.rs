//! Requests
//!
//! [`RequestConfiguration`] holds what a family of requests binds,
//! [`HardwareRequest`] turns it into driver submissions and
//! [`RequestHandler`] tracks requests from enqueue to wait.

pub mod config;
mod handler;
pub mod hardware;

pub use config::{ActiveList, ConfigId, LayerConfiguration, RequestConfiguration};
pub(crate) use handler::{Completion, Execution};
pub use handler::{RequestHandler, RequestId, RequestOutcome, RequestState};
pub use hardware::HardwareRequest;
