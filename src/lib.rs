pub mod api;
pub mod capacity;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod worker;

pub use error::{BatchError, Result};
pub use orchestrator::Orchestrator;
