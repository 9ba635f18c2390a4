//! # mbridge Plugin System
//!
//! Registration and lifecycle of platform plugins.
//!
//! ## Key Submodules and Responsibilities:
//!
//! - **[`manifest`]**: `plugin.json` parsing and validation ([`PluginManifest`]):
//!   loadable module kind, entry point, forbidden dependencies and the
//!   core-compatibility range.
//! - **[`loader`]**: [`PlatformLoader`] turns a manifest into a running
//!   [`Platform`] handle; [`StaticPlatformLoader`] resolves entry points
//!   against factories registered at build time.
//! - **[`registry`]**: the in-memory [`PluginRegistry`], the [`Plugin`] record
//!   with its [`PluginStatus`], and the projections used for persistence and
//!   for bus subscribers.
//! - **[`config`]**: per-plugin configuration files and schema validation.
//! - **[`package`]**: the host package manager collaborator.
//! - **[`manager`]**: [`PluginManager`], the single writer of the registry and
//!   driver of `load -> start -> configure -> shutdown`.
//! - **[`traits`]**: the [`Platform`] capability interface and the
//!   [`BridgeHandle`] platforms use to contribute devices.
//! - **[`error`]**: [`PluginSystemError`].
pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod traits;

pub use config::PluginConfigLoader;
pub use error::PluginSystemError;
pub use loader::{PlatformFactory, PlatformLoader, StaticPlatformLoader};
pub use manager::{PluginManager, PluginManagerOptions, ShutdownOptions};
pub use manifest::{PluginManifest, ResolvedPlugin};
pub use package::{CommandPackageManager, PackageManager};
pub use registry::{Plugin, PluginRegistry, PluginSnapshot, PluginStatus, StoredPlugin};
pub use traits::{
    BridgeHandle, BridgedDevice, DeviceHost, LifecycleReason, Platform, PlatformContext, PlatformError, PlatformType,
};

#[cfg(test)]
mod tests;
