use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::record::CommissioningState;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manifest::{PluginManifest, ResolvedPlugin};
use crate::plugin_system::traits::{Platform, PlatformType};
use crate::storage::context::StorageContext;

/// Runtime status of a registered plugin.
///
/// `Started` implies loaded and `Configured` implies started. `Errored` stays
/// until the plugin is shut down or reloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Unregistered,
    Loaded,
    Started,
    Configured,
    Errored,
}

impl PluginStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PluginStatus::Loaded | PluginStatus::Started | PluginStatus::Configured)
    }

    pub fn is_started(&self) -> bool {
        matches!(self, PluginStatus::Started | PluginStatus::Configured)
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, PluginStatus::Configured)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, PluginStatus::Errored)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PluginStatus::Unregistered => "unregistered",
            PluginStatus::Loaded => "loaded",
            PluginStatus::Started => "started",
            PluginStatus::Configured => "configured",
            PluginStatus::Errored => "errored",
        };
        f.write_str(text)
    }
}

/// Handles that only exist while a plugin is loaded
#[derive(Clone)]
pub struct PluginRuntime {
    pub platform: Arc<dyn Platform>,
    pub config: Value,
    pub schema: Value,
    pub storage: StorageContext,
    pub manifest: PluginManifest,
}

impl fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("platform_type", &self.platform.platform_type())
            .field("storage", &self.storage)
            .finish()
    }
}

/// One registered integration module
#[derive(Debug, Clone)]
pub struct Plugin {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<String>,
    pub help: Option<String>,
    pub changelog: Option<String>,
    pub funding: Option<String>,
    pub platform_type: PlatformType,
    pub status: PluginStatus,
    pub enabled: bool,
    /// Set while the plugin's endpoint is being constructed
    pub locked: bool,
    pub last_error: Option<String>,
    /// Bumped by load and shutdown; completions of an older generation are discarded
    pub generation: u64,
    pub runtime: Option<PluginRuntime>,
    pub endpoint: Option<String>,
    pub aggregator: bool,
    pub registered_devices: usize,
    pub added_devices: usize,
    pub commissioning: CommissioningState,
}

impl Plugin {
    pub fn from_resolved(resolved: &ResolvedPlugin) -> Self {
        let manifest = &resolved.manifest;
        Self {
            name: manifest.name.clone(),
            path: resolved.dir.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            homepage: manifest.homepage.clone(),
            help: manifest.help.clone(),
            changelog: manifest.changelog.clone(),
            funding: manifest.funding.clone(),
            platform_type: PlatformType::AnyPlatform,
            status: PluginStatus::Unregistered,
            enabled: true,
            locked: false,
            last_error: None,
            generation: 0,
            runtime: None,
            endpoint: None,
            aggregator: false,
            registered_devices: 0,
            added_devices: 0,
            commissioning: CommissioningState::default(),
        }
    }

    pub fn from_stored(stored: StoredPlugin) -> Self {
        Self {
            name: stored.name,
            path: stored.path,
            version: stored.version,
            description: stored.description,
            author: stored.author,
            homepage: stored.homepage,
            help: stored.help,
            changelog: stored.changelog,
            funding: stored.funding,
            platform_type: stored.platform_type,
            status: PluginStatus::Unregistered,
            enabled: stored.enabled,
            locked: false,
            last_error: None,
            generation: 0,
            runtime: None,
            endpoint: None,
            aggregator: false,
            registered_devices: 0,
            added_devices: 0,
            commissioning: CommissioningState::default(),
        }
    }

    /// Refresh identity fields after the manifest was read again
    pub fn update_identity(&mut self, manifest: &PluginManifest) {
        self.version = manifest.version.clone();
        self.description = manifest.description.clone();
        self.author = manifest.author.clone();
        self.homepage = manifest.homepage.clone();
        self.help = manifest.help.clone();
        self.changelog = manifest.changelog.clone();
        self.funding = manifest.funding.clone();
    }

    /// Drop every runtime association and return to `Unregistered`
    pub fn reset_runtime(&mut self) {
        self.status = PluginStatus::Unregistered;
        self.locked = false;
        self.last_error = None;
        self.runtime = None;
        self.endpoint = None;
        self.aggregator = false;
        self.registered_devices = 0;
        self.added_devices = 0;
        self.commissioning = CommissioningState::default();
    }

    pub fn to_stored(&self) -> StoredPlugin {
        StoredPlugin {
            name: self.name.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            homepage: self.homepage.clone(),
            help: self.help.clone(),
            changelog: self.changelog.clone(),
            funding: self.funding.clone(),
            platform_type: self.platform_type,
            enabled: self.enabled,
        }
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            name: self.name.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            homepage: self.homepage.clone(),
            platform_type: self.platform_type,
            status: self.status,
            enabled: self.enabled,
            loaded: self.status.is_loaded(),
            started: self.status.is_started(),
            configured: self.status.is_configured(),
            error: self.status.is_errored(),
            locked: self.locked,
            last_error: self.last_error.clone(),
            endpoint: self.endpoint.clone(),
            aggregator: self.aggregator,
            registered_devices: self.registered_devices,
            added_devices: self.added_devices,
            paired: self.commissioning.paired,
            manual_pairing_code: self.commissioning.manual_pairing_code.clone(),
            qr_pairing_code: self.commissioning.qr_pairing_code.clone(),
            fabrics: self.commissioning.fabrics.len(),
            sessions: self.commissioning.sessions.len(),
            config: self.runtime.as_ref().map(|runtime| runtime.config.clone()),
        }
    }
}

/// Storage-safe projection of a plugin; never carries runtime handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPlugin {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<String>,
    #[serde(rename = "type", default)]
    pub platform_type: PlatformType,
    pub enabled: bool,
}

/// View of a plugin handed to bus subscribers and the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSnapshot {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(rename = "type")]
    pub platform_type: PlatformType,
    pub status: PluginStatus,
    pub enabled: bool,
    pub loaded: bool,
    pub started: bool,
    pub configured: bool,
    pub error: bool,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub aggregator: bool,
    pub registered_devices: usize,
    pub added_devices: usize,
    pub paired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_pairing_code: Option<String>,
    pub fabrics: usize,
    pub sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// In-memory map of registered plugins. Only the plugin manager writes to it.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Plugin> {
        self.plugins.get_mut(name)
    }

    /// Insert or replace the record stored under the plugin's name
    pub fn set(&mut self, plugin: Plugin) -> Option<Plugin> {
        self.plugins.insert(plugin.name.clone(), plugin)
    }

    pub fn remove(&mut self, name: &str) -> Option<Plugin> {
        self.plugins.remove(name)
    }

    /// Plugins in name order
    pub fn list(&self) -> Vec<&Plugin> {
        self.plugins.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn clear(&mut self) {
        self.plugins.clear();
    }

    pub fn to_stored(&self) -> Vec<StoredPlugin> {
        self.plugins.values().map(Plugin::to_stored).collect()
    }

    /// Run `f` for every plugin. A failing or panicking callback is logged
    /// and does not stop the iteration. Returns the number of failures.
    pub fn for_each_isolated<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut Plugin) -> Result<(), PluginSystemError>,
    {
        let mut failures = 0;
        for plugin in self.plugins.values_mut() {
            match catch_unwind(AssertUnwindSafe(|| f(plugin))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    log::error!("Plugin '{}': {}", plugin.name, e);
                }
                Err(_) => {
                    failures += 1;
                    log::error!("Plugin '{}': callback panicked", plugin.name);
                }
            }
        }
        failures
    }
}
