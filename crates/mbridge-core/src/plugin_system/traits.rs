use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin_system::error::PluginSystemError;
use crate::storage::context::StorageContext;

/// Capability class of a platform plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformType {
    /// Placeholder until the plugin has been loaded once
    #[default]
    AnyPlatform,
    /// Contributes exactly one device, no aggregation
    AccessoryPlatform,
    /// Contributes zero or more devices behind an aggregation point
    DynamicPlatform,
}

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::AnyPlatform => "AnyPlatform",
            PlatformType::AccessoryPlatform => "AccessoryPlatform",
            PlatformType::DynamicPlatform => "DynamicPlatform",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a lifecycle hook is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleReason {
    Startup,
    Install,
    Reload,
    Request,
    Disable,
    Remove,
    Shutdown,
    Restart,
}

impl fmt::Display for LifecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LifecycleReason::Startup => "startup",
            LifecycleReason::Install => "install",
            LifecycleReason::Reload => "reload",
            LifecycleReason::Request => "request",
            LifecycleReason::Disable => "disable",
            LifecycleReason::Remove => "remove",
            LifecycleReason::Shutdown => "shutdown",
            LifecycleReason::Restart => "restart",
        };
        f.write_str(text)
    }
}

/// Failure reported by a platform's own code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl From<&str> for PlatformError {
    fn from(message: &str) -> Self {
        PlatformError(message.to_string())
    }
}

impl From<String> for PlatformError {
    fn from(message: String) -> Self {
        PlatformError(message)
    }
}

impl From<PluginSystemError> for PlatformError {
    fn from(err: PluginSystemError) -> Self {
        PlatformError(err.to_string())
    }
}

/// A device contributed by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgedDevice {
    /// Unique within the owning plugin
    pub id: String,
    pub name: String,
    /// Device class, e.g. `light` or `contact-sensor`
    pub kind: String,
    #[serde(default)]
    pub plugin: String,
}

impl BridgedDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            plugin: String::new(),
        }
    }
}

/// Running platform instance. Hooks are driven by the plugin manager and
/// always run in their own task, so a panic surfaces as a hook failure.
#[async_trait]
pub trait Platform: Send + Sync {
    fn platform_type(&self) -> PlatformType;

    async fn on_start(&self, reason: LifecycleReason) -> Result<(), PlatformError>;

    async fn on_configure(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn on_shutdown(&self, reason: LifecycleReason) -> Result<(), PlatformError>;
}

/// Side of the core that accepts devices from plugins
#[async_trait]
pub trait DeviceHost: Send + Sync {
    async fn register_device(&self, plugin: &str, device: BridgedDevice) -> Result<(), PluginSystemError>;

    async fn unregister_device(&self, plugin: &str, device_id: &str) -> Result<(), PluginSystemError>;

    /// Returns how many devices were removed
    async fn remove_all_devices(&self, plugin: &str) -> Result<usize, PluginSystemError>;

    /// The plugin was shut down; release anything held on its behalf
    async fn release_plugin(&self, plugin: &str) -> Result<(), PluginSystemError>;
}

/// Handle a platform uses to call back into the core
#[derive(Clone)]
pub struct BridgeHandle {
    plugin: String,
    host: Option<Weak<dyn DeviceHost>>,
}

impl fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("plugin", &self.plugin)
            .field("attached", &self.host.as_ref().is_some_and(|h| h.strong_count() > 0))
            .finish()
    }
}

impl BridgeHandle {
    pub fn new(plugin: &str, host: Option<Weak<dyn DeviceHost>>) -> Self {
        Self {
            plugin: plugin.to_string(),
            host,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    fn host(&self) -> Result<Arc<dyn DeviceHost>, PluginSystemError> {
        self.host
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| PluginSystemError::HostUnavailable { plugin: self.plugin.clone() })
    }

    pub async fn register_device(&self, mut device: BridgedDevice) -> Result<(), PluginSystemError> {
        device.plugin = self.plugin.clone();
        self.host()?.register_device(&self.plugin, device).await
    }

    pub async fn unregister_device(&self, device_id: &str) -> Result<(), PluginSystemError> {
        self.host()?.unregister_device(&self.plugin, device_id).await
    }

    pub async fn remove_all_devices(&self) -> Result<usize, PluginSystemError> {
        self.host()?.remove_all_devices(&self.plugin).await
    }
}

/// Everything a platform factory receives when a plugin is loaded
#[derive(Debug, Clone)]
pub struct PlatformContext {
    pub name: String,
    pub config: Value,
    pub storage: StorageContext,
    pub bridge: BridgeHandle,
}

impl PlatformContext {
    pub fn debug(&self) -> bool {
        self.config.get("debug").and_then(Value::as_bool).unwrap_or(false)
    }
}
