use std::fmt::Debug;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::endpoint::record::CommissioningState;
use crate::event::types::{Message, PluginEvent};
use crate::event::{BroadcastBus, BusHandler, SubscriberId};
use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::Result;
use crate::plugin_system::config::{PluginConfigLoader, with_scaffold};
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::loader::PlatformLoader;
use crate::plugin_system::manifest::{PluginManifest, ResolvedPlugin};
use crate::plugin_system::package::PackageManager;
use crate::plugin_system::registry::{Plugin, PluginRegistry, PluginRuntime, PluginSnapshot, PluginStatus, StoredPlugin};
use crate::plugin_system::traits::{BridgeHandle, DeviceHost, LifecycleReason, PlatformContext, PlatformError, PlatformType};
use crate::storage::context::PersistenceStore;

type PluginResult<T> = std::result::Result<T, PluginSystemError>;

/// Options for [`PluginManager::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    pub reason: LifecycleReason,
    /// Also remove every device the plugin contributed
    pub remove_all_devices: bool,
    /// Report success even when the shutdown hook fails. A plugin that was
    /// never loaded is always shut down, with only a log line.
    pub tolerate_hook_failure: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            reason: LifecycleReason::Request,
            remove_all_devices: false,
            tolerate_hook_failure: true,
        }
    }
}

impl ShutdownOptions {
    pub fn new(reason: LifecycleReason) -> Self {
        Self {
            reason,
            ..Self::default()
        }
    }

    pub fn remove_devices(mut self, remove: bool) -> Self {
        self.remove_all_devices = remove;
        self
    }

    pub fn tolerate_hook_failure(mut self, tolerate: bool) -> Self {
        self.tolerate_hook_failure = tolerate;
        self
    }
}

/// Collaborators handed to the [`PluginManager`] at construction
pub struct PluginManagerOptions {
    pub store: Arc<dyn PersistenceStore>,
    pub loader: Arc<dyn PlatformLoader>,
    pub packages: Arc<dyn PackageManager>,
    pub bus: Arc<BroadcastBus>,
    pub configs: PluginConfigLoader,
    /// Directories searched when a plugin is referenced by name
    pub plugin_dirs: Vec<PathBuf>,
}

/// Owner of the plugin registry and driver of every plugin's lifecycle.
///
/// Registry mutations happen in short critical sections; the lock is never
/// held while a plugin hook runs or while an event is published.
pub struct PluginManager {
    name: &'static str,
    registry: Mutex<PluginRegistry>,
    persist_lock: Mutex<()>,
    store: Arc<dyn PersistenceStore>,
    loader: Arc<dyn PlatformLoader>,
    packages: Arc<dyn PackageManager>,
    bus: Arc<BroadcastBus>,
    configs: PluginConfigLoader,
    plugin_dirs: Vec<PathBuf>,
    host: RwLock<Option<Weak<dyn DeviceHost>>>,
    subscription: std::sync::Mutex<Option<SubscriberId>>,
    self_ref: Weak<PluginManager>,
}

impl Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("name", &self.name)
            .field("plugin_dirs", &self.plugin_dirs)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// Storage namespace of a plugin's own persistence context
pub fn plugin_storage_namespace(plugin: &str) -> String {
    format!("plugin.{}", plugin)
}

impl PluginManager {
    pub fn new(options: PluginManagerOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: "PluginManager",
            registry: Mutex::new(PluginRegistry::new()),
            persist_lock: Mutex::new(()),
            store: options.store,
            loader: options.loader,
            packages: options.packages,
            bus: options.bus,
            configs: options.configs,
            plugin_dirs: options.plugin_dirs,
            host: RwLock::new(None),
            subscription: std::sync::Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    pub fn configs(&self) -> &PluginConfigLoader {
        &self.configs
    }

    pub fn plugin_dirs(&self) -> &[PathBuf] {
        &self.plugin_dirs
    }

    /// Attach the side of the core that receives devices from platforms
    pub fn set_host(&self, host: Weak<dyn DeviceHost>) {
        let mut slot = self.host.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(host);
    }

    pub fn host(&self) -> Option<Arc<dyn DeviceHost>> {
        let slot = self.host.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().and_then(Weak::upgrade)
    }

    fn host_weak(&self) -> Option<Weak<dyn DeviceHost>> {
        let slot = self.host.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }

    async fn emit(&self, event: PluginEvent, plugin: &str) {
        log::debug!("Plugin event '{}' for '{}'", event, plugin);
        self.bus.publish(event.message(plugin)).await;
    }

    // ---- resolution -------------------------------------------------------

    /// Locate and validate a plugin manifest. Accepts a plugin directory, a
    /// manifest file or a bare name looked up in the plugin directories.
    pub fn resolve(&self, target: &str) -> PluginResult<ResolvedPlugin> {
        let manifest_path = self.find_manifest(target)?;
        let manifest = PluginManifest::from_file(&manifest_path)?;
        manifest.validate(&manifest_path)?;

        let dir = manifest_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let dir = dir.canonicalize().unwrap_or(dir);
        Ok(ResolvedPlugin { manifest, dir })
    }

    fn find_manifest(&self, target: &str) -> PluginResult<PathBuf> {
        let not_found = |path: Option<PathBuf>| PluginSystemError::ManifestNotFound {
            target: target.to_string(),
            path,
        };
        if target.trim().is_empty() {
            return Err(not_found(None));
        }

        let candidate = PathBuf::from(target);
        if candidate.is_dir() {
            let manifest = candidate.join(constants::PLUGIN_MANIFEST_FILE);
            return if manifest.is_file() { Ok(manifest) } else { Err(not_found(Some(manifest))) };
        }
        if candidate.is_file() {
            return Ok(candidate);
        }
        if candidate.components().count() > 1 || candidate.is_absolute() {
            return Err(not_found(Some(candidate)));
        }

        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(target).join(constants::PLUGIN_MANIFEST_FILE))
            .find(|manifest| manifest.is_file())
            .ok_or_else(|| not_found(None))
    }

    /// Name of a registered plugin given its name or a resolvable path
    async fn registered_name(&self, target: &str) -> PluginResult<String> {
        if self.registry.lock().await.has(target) {
            return Ok(target.to_string());
        }
        let name = match self.resolve(target) {
            Ok(resolved) => resolved.manifest.name,
            Err(e) => {
                log::debug!("'{}' is neither registered nor resolvable: {}", target, e);
                return Err(PluginSystemError::not_found(target));
            }
        };
        if self.registry.lock().await.has(&name) {
            Ok(name)
        } else {
            Err(PluginSystemError::not_found(&name))
        }
    }

    // ---- queries ------------------------------------------------------------

    pub async fn has(&self, name: &str) -> bool {
        self.registry.lock().await.has(name)
    }

    pub async fn get(&self, name: &str) -> Option<PluginSnapshot> {
        self.registry.lock().await.get(name).map(Plugin::snapshot)
    }

    pub async fn list(&self) -> Vec<PluginSnapshot> {
        self.registry.lock().await.list().into_iter().map(Plugin::snapshot).collect()
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    /// Plugins currently holding a runtime
    pub async fn loaded_count(&self) -> usize {
        self.registry
            .lock()
            .await
            .list()
            .into_iter()
            .filter(|plugin| plugin.runtime.is_some())
            .count()
    }

    pub async fn status(&self, name: &str) -> Option<PluginStatus> {
        self.registry.lock().await.get(name).map(|plugin| plugin.status)
    }

    /// Statuses of the given plugins, in the order asked for
    pub async fn statuses(&self, names: &[String]) -> Vec<(String, Option<PluginStatus>)> {
        let registry = self.registry.lock().await;
        names
            .iter()
            .map(|name| (name.clone(), registry.get(name).map(|plugin| plugin.status)))
            .collect()
    }

    pub async fn enabled_names(&self) -> Vec<String> {
        self.registry
            .lock()
            .await
            .list()
            .into_iter()
            .filter(|plugin| plugin.enabled)
            .map(|plugin| plugin.name.clone())
            .collect()
    }

    pub async fn platform_type(&self, name: &str) -> Option<PlatformType> {
        self.registry.lock().await.get(name).map(|plugin| plugin.platform_type)
    }

    /// Configuration of a loaded plugin
    pub async fn plugin_config(&self, name: &str) -> Option<Value> {
        self.registry
            .lock()
            .await
            .get(name)
            .and_then(|plugin| plugin.runtime.as_ref())
            .map(|runtime| runtime.config.clone())
    }

    // ---- registration -----------------------------------------------------

    /// Register a plugin, enabled. Fails without writing when already registered.
    pub async fn add(&self, target: &str) -> PluginResult<PluginSnapshot> {
        let resolved = self.resolve(target)?;
        let name = resolved.manifest.name.clone();
        let snapshot = {
            let mut registry = self.registry.lock().await;
            if registry.has(&name) {
                return Err(PluginSystemError::AlreadyRegistered { name });
            }
            let plugin = Plugin::from_resolved(&resolved);
            let snapshot = plugin.snapshot();
            registry.set(plugin);
            snapshot
        };

        if let Err(e) = self.save_to_storage().await {
            self.registry.lock().await.remove(&name);
            return Err(e);
        }
        log::info!("Added plugin '{}' from {}", name, resolved.dir.display());
        self.emit(PluginEvent::Added, &name).await;
        Ok(snapshot)
    }

    /// Deregister a plugin, shutting it down first when loaded
    pub async fn remove(&self, target: &str) -> PluginResult<PluginSnapshot> {
        let name = self.registered_name(target).await?;
        if self.holds_runtime(&name).await {
            self.shutdown(&name, ShutdownOptions::new(LifecycleReason::Remove).remove_devices(true))
                .await?;
        }

        let removed = self
            .registry
            .lock()
            .await
            .remove(&name)
            .ok_or_else(|| PluginSystemError::not_found(&name))?;
        if let Err(e) = self.save_to_storage().await {
            self.registry.lock().await.set(removed);
            return Err(e);
        }
        log::info!("Removed plugin '{}'", name);
        self.emit(PluginEvent::Removed, &name).await;
        Ok(removed.snapshot())
    }

    pub async fn enable(&self, target: &str) -> PluginResult<PluginSnapshot> {
        let name = self.registered_name(target).await?;
        let snapshot = self.set_enabled(&name, true).await?;
        log::info!("Enabled plugin '{}'", name);
        self.emit(PluginEvent::Enabled, &name).await;
        Ok(snapshot)
    }

    /// Disable a plugin, shutting it down first when loaded
    pub async fn disable(&self, target: &str) -> PluginResult<PluginSnapshot> {
        let name = self.registered_name(target).await?;
        if self.holds_runtime(&name).await {
            self.shutdown(&name, ShutdownOptions::new(LifecycleReason::Disable).remove_devices(true))
                .await?;
        }
        let snapshot = self.set_enabled(&name, false).await?;
        log::info!("Disabled plugin '{}'", name);
        self.emit(PluginEvent::Disabled, &name).await;
        Ok(snapshot)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> PluginResult<PluginSnapshot> {
        let previous = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            std::mem::replace(&mut plugin.enabled, enabled)
        };
        if let Err(e) = self.save_to_storage().await {
            if let Some(plugin) = self.registry.lock().await.get_mut(name) {
                plugin.enabled = previous;
            }
            return Err(e);
        }
        self.get(name).await.ok_or_else(|| PluginSystemError::not_found(name))
    }

    async fn holds_runtime(&self, name: &str) -> bool {
        self.registry
            .lock()
            .await
            .get(name)
            .is_some_and(|plugin| plugin.runtime.is_some() || plugin.status != PluginStatus::Unregistered)
    }

    /// Install a package and bring its plugin up. Installing the core itself
    /// only announces that a restart is required and returns `None`.
    pub async fn install(&self, package: &str) -> PluginResult<Option<PluginSnapshot>> {
        self.packages.install(package).await?;
        log::info!("Installed package '{}'", package);

        if package == constants::CORE_PACKAGE_NAME {
            let message = Message::event(
                constants::PLUGINS_CHANNEL,
                constants::BROADCAST,
                "restart_required",
                json!({ "package": package }),
            );
            self.bus.publish(message).await;
            return Ok(None);
        }

        let name = self.resolve(package)?.manifest.name;
        if self.has(&name).await {
            return self.reload(&name).await.map(Some);
        }
        self.add(package).await?;
        self.load(&name).await?;
        self.start(&name, LifecycleReason::Install).await.map(Some)
    }

    /// Shut down and deregister the package's plugin, then remove the package
    pub async fn uninstall(&self, package: &str) -> PluginResult<()> {
        if package == constants::CORE_PACKAGE_NAME {
            return Err(PluginSystemError::precondition(
                package,
                "uninstall",
                "the core package cannot be uninstalled",
            ));
        }
        let name = self
            .resolve(package)
            .map(|resolved| resolved.manifest.name)
            .unwrap_or_else(|_| package.to_string());
        if self.has(&name).await {
            self.remove(&name).await?;
        }
        self.packages.uninstall(package).await?;
        log::info!("Uninstalled package '{}'", package);
        Ok(())
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Instantiate an enabled, unloaded plugin
    pub async fn load(&self, name: &str) -> PluginResult<PluginSnapshot> {
        let (dir, platform_type, generation) = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            if !plugin.enabled {
                return Err(PluginSystemError::precondition(name, "load", "plugin is disabled"));
            }
            if plugin.status != PluginStatus::Unregistered {
                return Err(PluginSystemError::precondition(
                    name,
                    "load",
                    format!("plugin is {}", plugin.status),
                ));
            }
            plugin.generation += 1;
            (plugin.path.clone(), plugin.platform_type, plugin.generation)
        };

        let runtime = match self.prepare_runtime(name, &dir, platform_type).await {
            Ok(runtime) => runtime,
            Err(e) => return Err(self.fail(name, generation, "load", e).await),
        };

        let snapshot = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            if plugin.generation != generation {
                return Err(PluginSystemError::Stale {
                    plugin: name.to_string(),
                    operation: "load".to_string(),
                });
            }
            plugin.update_identity(&runtime.manifest);
            plugin.platform_type = runtime.platform.platform_type();
            plugin.runtime = Some(runtime);
            plugin.status = PluginStatus::Loaded;
            plugin.last_error = None;
            plugin.snapshot()
        };

        self.save_to_storage().await?;
        log::info!("Loaded plugin '{}' ({})", name, snapshot.platform_type);
        self.emit(PluginEvent::Loaded, name).await;
        Ok(snapshot)
    }

    async fn prepare_runtime(
        &self,
        name: &str,
        dir: &Path,
        known_type: PlatformType,
    ) -> PluginResult<PluginRuntime> {
        let manifest_path = dir.join(constants::PLUGIN_MANIFEST_FILE);
        let manifest = PluginManifest::from_file(&manifest_path)?;
        manifest.validate(&manifest_path)?;
        if manifest.name != name {
            return Err(PluginSystemError::ManifestInvalid {
                path: manifest_path,
                message: format!("manifest now declares name '{}'", manifest.name),
                source: None,
            });
        }

        let config = self.configs.load_config(&manifest, dir, known_type)?;
        let schema = self.configs.load_schema(&manifest, dir)?;
        for warning in self.configs.validate(name, &config, &schema) {
            log::warn!("Configuration of plugin '{}': {}", name, warning);
        }

        let namespace = plugin_storage_namespace(name);
        let storage = self.store.context(&namespace).await?;
        let context = PlatformContext {
            name: name.to_string(),
            config: config.clone(),
            storage: storage.clone(),
            bridge: BridgeHandle::new(name, self.host_weak()),
        };

        let instantiated = catch_unwind(AssertUnwindSafe(|| self.loader.instantiate(&manifest, context)))
            .unwrap_or_else(|_| {
                Err(PluginSystemError::LoadFailed {
                    plugin: name.to_string(),
                    message: "entry point panicked".to_string(),
                })
            });
        let platform = match instantiated {
            Ok(platform) => platform,
            Err(e) => {
                self.store.close_context(&namespace).await?;
                return Err(e);
            }
        };

        Ok(PluginRuntime {
            platform,
            config,
            schema,
            storage,
            manifest,
        })
    }

    /// Run a loaded plugin's start hook
    pub async fn start(&self, name: &str, reason: LifecycleReason) -> PluginResult<PluginSnapshot> {
        let (platform, generation) = {
            let registry = self.registry.lock().await;
            let plugin = registry.get(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            if plugin.status != PluginStatus::Loaded {
                return Err(PluginSystemError::precondition(
                    name,
                    "start",
                    format!("plugin is {}", plugin.status),
                ));
            }
            let runtime = plugin
                .runtime
                .as_ref()
                .ok_or_else(|| PluginSystemError::precondition(name, "start", "plugin has no platform"))?;
            (runtime.platform.clone(), plugin.generation)
        };

        let hook = run_hook(name, "start", async move { platform.on_start(reason).await }).await;
        if let Err(e) = hook {
            return Err(self.fail(name, generation, "start", e).await);
        }

        let (snapshot, config) = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            if plugin.generation != generation {
                return Err(PluginSystemError::Stale {
                    plugin: name.to_string(),
                    operation: "start".to_string(),
                });
            }
            plugin.status = PluginStatus::Started;
            let platform_type = plugin.platform_type;
            let config = plugin.runtime.as_mut().map(|runtime| {
                runtime.config = with_scaffold(runtime.config.clone(), name, platform_type);
                runtime.config.clone()
            });
            (plugin.snapshot(), config)
        };

        if let Some(config) = config {
            self.configs.save_config(name, &config)?;
        }
        log::info!("Started plugin '{}' ({})", name, reason);
        self.emit(PluginEvent::Started, name).await;
        Ok(snapshot)
    }

    /// Run a started plugin's configure hook. Already configured is a no-op.
    pub async fn configure(&self, name: &str) -> PluginResult<PluginSnapshot> {
        let (platform, generation) = {
            let registry = self.registry.lock().await;
            let plugin = registry.get(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            match plugin.status {
                PluginStatus::Configured => return Ok(plugin.snapshot()),
                PluginStatus::Started => {}
                status => {
                    return Err(PluginSystemError::precondition(
                        name,
                        "configure",
                        format!("plugin is {}", status),
                    ));
                }
            }
            let runtime = plugin
                .runtime
                .as_ref()
                .ok_or_else(|| PluginSystemError::precondition(name, "configure", "plugin has no platform"))?;
            (runtime.platform.clone(), plugin.generation)
        };

        let hook = run_hook(name, "configure", async move { platform.on_configure().await }).await;
        if let Err(e) = hook {
            return Err(self.fail(name, generation, "configure", e).await);
        }

        let snapshot = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            if plugin.generation != generation {
                return Err(PluginSystemError::Stale {
                    plugin: name.to_string(),
                    operation: "configure".to_string(),
                });
            }
            plugin.status = PluginStatus::Configured;
            plugin.snapshot()
        };
        log::info!("Configured plugin '{}'", name);
        self.emit(PluginEvent::Configured, name).await;
        Ok(snapshot)
    }

    /// Return a plugin to `Unregistered` from any state.
    ///
    /// The shutdown hook runs when a platform exists; everything else is
    /// cleared regardless of its outcome. Hook failures are only reported
    /// when `force` is off.
    pub async fn shutdown(&self, name: &str, options: ShutdownOptions) -> PluginResult<PluginSnapshot> {
        let runtime = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            plugin.generation += 1;
            plugin.runtime.take()
        };

        let mut hook_error = None;
        if runtime.is_none() {
            log::debug!("Plugin '{}' was not loaded; clearing its state only", name);
        }
        if let Some(runtime) = runtime {
            let platform = runtime.platform.clone();
            let reason = options.reason;
            if let Err(e) = run_hook(name, "shutdown", async move { platform.on_shutdown(reason).await }).await {
                log::warn!("{}", e);
                hook_error = Some(e);
            }
            if let Err(e) = self.store.close_context(runtime.storage.namespace()).await {
                log::warn!("Closing storage of plugin '{}' failed: {}", name, e);
            }
        }

        let snapshot = {
            let mut registry = self.registry.lock().await;
            let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
            plugin.reset_runtime();
            plugin.snapshot()
        };

        if let Some(host) = self.host() {
            if options.remove_all_devices {
                match host.remove_all_devices(name).await {
                    Ok(0) => {}
                    Ok(count) => log::info!("Removed {} device(s) of plugin '{}'", count, name),
                    Err(e) => log::warn!("Removing devices of plugin '{}' failed: {}", name, e),
                }
            }
            if let Err(e) = host.release_plugin(name).await {
                log::warn!("Releasing plugin '{}' failed: {}", name, e);
            }
        }

        log::info!("Shut down plugin '{}' ({})", name, options.reason);
        self.emit(PluginEvent::Shutdown, name).await;
        match hook_error {
            Some(e) if !options.tolerate_hook_failure => Err(e),
            _ => Ok(snapshot),
        }
    }

    /// Shut down, then load, start and configure again. The way out of `Errored`.
    pub async fn reload(&self, name: &str) -> PluginResult<PluginSnapshot> {
        self.shutdown(name, ShutdownOptions::new(LifecycleReason::Reload)).await?;
        self.load(name).await?;
        self.start(name, LifecycleReason::Reload).await?;
        self.configure(name).await
    }

    /// Record a failure for the generation that produced it and hand the error back
    async fn fail(&self, name: &str, generation: u64, operation: &str, error: PluginSystemError) -> PluginSystemError {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(name) {
            Some(plugin) if plugin.generation == generation => {
                log::error!("Plugin '{}' failed to {}: {}", name, operation, error);
                plugin.status = PluginStatus::Errored;
                plugin.last_error = Some(error.to_string());
                error
            }
            _ => {
                log::debug!("Discarding stale {} failure of plugin '{}': {}", operation, name, error);
                PluginSystemError::Stale {
                    plugin: name.to_string(),
                    operation: operation.to_string(),
                }
            }
        }
    }

    /// Force a plugin into `Errored`; in-flight hooks are discarded when they finish
    pub async fn mark_errored(&self, name: &str, message: &str) -> PluginResult<()> {
        let mut registry = self.registry.lock().await;
        let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
        plugin.generation += 1;
        plugin.status = PluginStatus::Errored;
        plugin.last_error = Some(message.to_string());
        log::error!("Plugin '{}' marked as errored: {}", name, message);
        Ok(())
    }

    // ---- endpoint bookkeeping ---------------------------------------------

    /// Take the construction lock. Returns false when it is already held.
    pub async fn try_lock(&self, name: &str) -> PluginResult<bool> {
        let mut registry = self.registry.lock().await;
        let plugin = registry.get_mut(name).ok_or_else(|| PluginSystemError::not_found(name))?;
        if plugin.locked {
            return Ok(false);
        }
        plugin.locked = true;
        Ok(true)
    }

    pub async fn unlock(&self, name: &str) {
        if let Some(plugin) = self.registry.lock().await.get_mut(name) {
            plugin.locked = false;
        }
    }

    pub async fn attach_endpoint(&self, name: &str, endpoint: &str, aggregator: bool) {
        if let Some(plugin) = self.registry.lock().await.get_mut(name) {
            plugin.endpoint = Some(endpoint.to_string());
            plugin.aggregator = aggregator;
        }
    }

    pub async fn set_device_counts(&self, name: &str, registered: usize, added: usize) {
        if let Some(plugin) = self.registry.lock().await.get_mut(name) {
            plugin.registered_devices = registered;
            plugin.added_devices = added;
        }
    }

    pub async fn update_commissioning(&self, name: &str, state: CommissioningState) {
        if let Some(plugin) = self.registry.lock().await.get_mut(name) {
            plugin.commissioning = state;
        }
    }

    /// Drop every in-memory record; persisted registrations are untouched
    pub async fn clear_registry(&self) {
        self.registry.lock().await.clear();
    }

    // ---- persistence ----------------------------------------------------------

    /// Populate the registry from the core context
    pub async fn load_from_storage(&self) -> PluginResult<usize> {
        let context = self.store.context(constants::CORE_CONTEXT).await?;
        let stored: Vec<StoredPlugin> = context.get(constants::PLUGINS_KEY, Vec::new()).await?;

        let mut registry = self.registry.lock().await;
        for entry in stored {
            match registry.get_mut(&entry.name) {
                Some(existing) => {
                    existing.enabled = entry.enabled;
                    if existing.runtime.is_none() {
                        existing.platform_type = entry.platform_type;
                    }
                }
                None => {
                    registry.set(Plugin::from_stored(entry));
                }
            }
        }
        let stale = registry.for_each_isolated(|plugin| {
            if plugin.runtime.is_some() {
                return Ok(());
            }
            let manifest = PluginManifest::from_file(&plugin.path.join(constants::PLUGIN_MANIFEST_FILE))?;
            plugin.update_identity(&manifest);
            Ok(())
        });
        if stale > 0 {
            log::warn!("{} registered plugin(s) have an unreadable manifest", stale);
        }
        log::info!("Loaded {} registered plugin(s) from storage", registry.len());
        Ok(registry.len())
    }

    /// Persist the storage-safe projection of every registered plugin
    pub async fn save_to_storage(&self) -> PluginResult<()> {
        let _guard = self.persist_lock.lock().await;
        let stored = self.registry.lock().await.to_stored();
        let context = self.store.context(constants::CORE_CONTEXT).await?;
        context.set(constants::PLUGINS_KEY, &stored).await?;
        Ok(())
    }

    // ---- bus ----------------------------------------------------------------

    /// Answer `plugins_*` requests on the plugins channel
    pub fn attach_bus(&self) {
        let mut subscription = self.subscription.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if subscription.is_some() {
            return;
        }
        let handler = Arc::new(PluginsRequestHandler {
            manager: self.self_ref.clone(),
        });
        *subscription = Some(self.bus.subscribe(constants::PLUGINS_CHANNEL, handler));
    }

    pub fn detach_bus(&self) {
        let mut subscription = self.subscription.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = subscription.take() {
            let _ = self.bus.unsubscribe(id);
        }
    }

    async fn answer(&self, message: &Message) -> Option<Value> {
        let name = message.param_str("name").unwrap_or_default();
        let outcome: PluginResult<Option<PluginSnapshot>> = match message.message_type.as_str() {
            "plugins_length" => return Some(json!({ "length": self.len().await })),
            "plugins_size" => return Some(json!({ "size": self.loaded_count().await })),
            "plugins_has" => return Some(json!({ "has": self.has(name).await })),
            "plugins_list" => return Some(json!({ "plugins": self.list().await })),
            "plugins_get" => self.get(name).await.map(Some).ok_or_else(|| PluginSystemError::not_found(name)),
            "plugins_add" => self.add(name).await.map(Some),
            "plugins_remove" => self.remove(name).await.map(Some),
            "plugins_enable" => self.enable(name).await.map(Some),
            "plugins_disable" => self.disable(name).await.map(Some),
            "plugins_install" => self.install(name).await,
            "plugins_uninstall" => self.uninstall(name).await.map(|_| None),
            "plugins_load" => self.load(name).await.map(Some),
            "plugins_start" => self.start(name, LifecycleReason::Request).await.map(Some),
            "plugins_configure" => self.configure(name).await.map(Some),
            "plugins_shutdown" => self.shutdown(name, ShutdownOptions::default()).await.map(Some),
            "plugins_reload" => self.reload(name).await.map(Some),
            _ => return None,
        };
        Some(match outcome {
            Ok(plugin) => json!({ "plugin": plugin }),
            Err(e) => {
                log::debug!("Request '{}' for '{}' failed: {}", message.message_type, name, e);
                json!({ "plugin": null, "error": e.to_string() })
            }
        })
    }
}

/// Run a plugin hook in its own task so a panic becomes a failure value
async fn run_hook<F>(plugin: &str, hook: &str, future: F) -> PluginResult<()>
where
    F: Future<Output = std::result::Result<(), PlatformError>> + Send + 'static,
{
    let failed = |message: String| PluginSystemError::HookFailed {
        plugin: plugin.to_string(),
        hook: hook.to_string(),
        message,
    };
    match tokio::spawn(future).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(failed(e.0)),
        Err(join) if join.is_panic() => Err(failed("hook panicked".to_string())),
        Err(_) => Err(failed("hook was cancelled".to_string())),
    }
}

struct PluginsRequestHandler {
    manager: Weak<PluginManager>,
}

#[async_trait]
impl BusHandler for PluginsRequestHandler {
    async fn handle(&self, message: &Message) -> Option<Value> {
        if !message.is_request() {
            return None;
        }
        let manager = self.manager.upgrade()?;
        manager.answer(message).await
    }
}

#[async_trait]
impl KernelComponent for PluginManager {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.load_from_storage().await?;
        self.attach_bus();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.detach_bus();
        Ok(())
    }
}
