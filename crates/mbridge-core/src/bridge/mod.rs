//! # mbridge Bridge Orchestration
//!
//! Maps plugins onto server endpoints and drives a whole run of the process.
//!
//! In [`BridgeMode::Bridge`] every plugin publishes into one shared aggregator
//! endpoint. It is started only after all enabled plugins reached `Started`,
//! so controllers never see a partial device set. In
//! [`BridgeMode::ChildBridge`] every plugin gets an endpoint of its own and a
//! failing plugin only takes its own endpoint down.
//!
//! - [`mode`]: topology selection and timing settings.
//! - [`supervisor`]: the periodic check that waits for plugins to start.
//! - [`devices`]: the core's registry of contributed devices.
//! - [`orchestrator`]: [`BridgeOrchestrator`], startup and ordered shutdown.
pub mod devices;
pub mod mode;
pub mod orchestrator;
pub mod supervisor;

pub use devices::{DeviceEntry, DeviceRegistry};
pub use mode::{BridgeMode, BridgeOverrides, BridgeSettings, TimingSettings};
pub use orchestrator::{BridgeOrchestrator, OrchestratorOptions};
pub use supervisor::{SupervisionOutcome, Supervisor};

#[cfg(test)]
mod tests;
