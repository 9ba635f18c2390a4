//! # mbridge-core
//!
//! Plugin lifecycle orchestration and bridge topology coordination.
//!
//! Plugins are platform modules resolved from a `plugin.json` manifest and
//! instantiated through a [`PlatformLoader`](plugin_system::PlatformLoader).
//! The [`PluginManager`] owns their registry and lifecycle, the
//! [`BridgeOrchestrator`] maps them onto server endpoints, and the
//! [`Application`] owns one process run from bootstrap to ordered shutdown.
pub mod bridge;
pub mod endpoint;
pub mod event;
pub mod frontend;
pub mod kernel;
pub mod plugin_system;
pub mod storage;

pub use bridge::{BridgeMode, BridgeOrchestrator, BridgeOverrides};
pub use event::{BroadcastBus, Message};
pub use kernel::error::Error as KernelError;
pub use kernel::{Application, ApplicationOptions, ExitReason};
pub use plugin_system::{PluginManager, PluginManifest, PluginSnapshot, PluginStatus};
pub use storage::DefaultStorageManager;

#[cfg(test)]
mod tests;
