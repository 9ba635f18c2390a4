use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manifest::PluginManifest;
use crate::plugin_system::traits::{Platform, PlatformContext, PlatformError};

/// Builds a platform instance from its load context
pub type PlatformFactory =
    Arc<dyn Fn(PlatformContext) -> Result<Arc<dyn Platform>, PlatformError> + Send + Sync>;

/// Turns a validated manifest into a running platform handle
pub trait PlatformLoader: Send + Sync + fmt::Debug {
    /// Whether the manifest's entry point can be instantiated
    fn has_entry_point(&self, manifest: &PluginManifest) -> bool;

    fn instantiate(
        &self,
        manifest: &PluginManifest,
        context: PlatformContext,
    ) -> Result<Arc<dyn Platform>, PluginSystemError>;
}

/// Loader resolving entry points against factories registered at build time
#[derive(Default, Clone)]
pub struct StaticPlatformLoader {
    factories: HashMap<String, PlatformFactory>,
}

impl fmt::Debug for StaticPlatformLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&String> = self.factories.keys().collect();
        entries.sort();
        f.debug_struct("StaticPlatformLoader").field("entries", &entries).finish()
    }
}

impl StaticPlatformLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an entry point name. Replaces any previous one.
    pub fn register<F>(&mut self, entry: &str, factory: F)
    where
        F: Fn(PlatformContext) -> Result<Arc<dyn Platform>, PlatformError> + Send + Sync + 'static,
    {
        if self.factories.insert(entry.to_string(), Arc::new(factory)).is_some() {
            log::warn!("Replaced platform factory for entry '{}'", entry);
        }
    }

    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.factories.keys().cloned().collect();
        entries.sort();
        entries
    }
}

impl PlatformLoader for StaticPlatformLoader {
    fn has_entry_point(&self, manifest: &PluginManifest) -> bool {
        manifest
            .entry_point()
            .map(|entry| self.factories.contains_key(entry))
            .unwrap_or(false)
    }

    fn instantiate(
        &self,
        manifest: &PluginManifest,
        context: PlatformContext,
    ) -> Result<Arc<dyn Platform>, PluginSystemError> {
        let entry = manifest.entry_point()?;
        let factory = self.factories.get(entry).ok_or_else(|| PluginSystemError::LoadFailed {
            plugin: manifest.name.clone(),
            message: format!("entry point '{}' is not available", entry),
        })?;
        (factory.as_ref())(context).map_err(|e| PluginSystemError::LoadFailed {
            plugin: manifest.name.clone(),
            message: e.to_string(),
        })
    }
}
