use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::devices::DeviceRegistry;
use crate::bridge::mode::{BridgeMode, TimingSettings};
use crate::bridge::supervisor::{SupervisionOutcome, Supervisor};
use crate::endpoint::error::EndpointError;
use crate::endpoint::lifecycle::EndpointLifecycle;
use crate::endpoint::record::{EndpointOwner, bridge_endpoint_id, plugin_endpoint_id};
use crate::event::types::{Message, SystemEvent};
use crate::event::{BroadcastBus, BusHandler, SubscriberId};
use crate::frontend::Frontend;
use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::{Error, Result};
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manager::{PluginManager, ShutdownOptions};
use crate::plugin_system::registry::PluginStatus;
use crate::plugin_system::traits::{BridgedDevice, DeviceHost, LifecycleReason, PlatformType};
use crate::storage::context::PersistenceStore;

/// How long a device contribution waits for another task's endpoint construction
const CONSTRUCTION_WAIT: Duration = Duration::from_secs(5);
const CONSTRUCTION_POLL: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn endpoint_failure(plugin: &str, operation: &str, err: EndpointError) -> PluginSystemError {
    PluginSystemError::precondition(plugin, operation, err.to_string())
}

/// Collaborators handed to the [`BridgeOrchestrator`] at construction
pub struct OrchestratorOptions {
    pub mode: BridgeMode,
    pub timing: TimingSettings,
    pub manager: Arc<PluginManager>,
    pub endpoints: Arc<EndpointLifecycle>,
    pub devices: Arc<DeviceRegistry>,
    pub bus: Arc<BroadcastBus>,
    pub store: Arc<dyn PersistenceStore>,
    pub frontend: Option<Arc<dyn Frontend>>,
}

/// Brings the enabled plugins up in the selected topology, exposes their
/// devices through endpoints and tears everything down in order.
pub struct BridgeOrchestrator {
    name: &'static str,
    mode: BridgeMode,
    timing: TimingSettings,
    manager: Arc<PluginManager>,
    endpoints: Arc<EndpointLifecycle>,
    devices: Arc<DeviceRegistry>,
    bus: Arc<BroadcastBus>,
    store: Arc<dyn PersistenceStore>,
    frontend: Option<Arc<dyn Frontend>>,
    run_token: Mutex<CancellationToken>,
    plugin_tokens: Mutex<HashMap<String, CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Plugins whose endpoints are past supervision and may start right away
    live: Mutex<HashSet<String>>,
    restart: CancellationToken,
    shutting_down: AtomicBool,
    subscription: Mutex<Option<SubscriberId>>,
    self_ref: Weak<BridgeOrchestrator>,
}

impl fmt::Debug for BridgeOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeOrchestrator")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("timing", &self.timing)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BridgeOrchestrator {
    /// Build the orchestrator and attach it to the plugin manager as device host
    pub fn new(options: OrchestratorOptions) -> Arc<Self> {
        let orchestrator = Arc::new_cyclic(|self_ref| Self {
            name: "BridgeOrchestrator",
            mode: options.mode,
            timing: options.timing,
            manager: options.manager,
            endpoints: options.endpoints,
            devices: options.devices,
            bus: options.bus,
            store: options.store,
            frontend: options.frontend,
            run_token: Mutex::new(CancellationToken::new()),
            plugin_tokens: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
            restart: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            subscription: Mutex::new(None),
            self_ref: self_ref.clone(),
        });
        let host: Weak<dyn DeviceHost> = Arc::downgrade(&orchestrator) as Weak<dyn DeviceHost>;
        orchestrator.manager.set_host(host);
        orchestrator
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn timing(&self) -> &TimingSettings {
        &self.timing
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn endpoints(&self) -> &Arc<EndpointLifecycle> {
        &self.endpoints
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once a restart was requested over the bus
    pub async fn restart_requested(&self) {
        self.restart.cancelled().await
    }

    pub fn request_restart(&self) {
        self.restart.cancel();
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(task);
    }

    /// Cancel whatever the previous startup left behind and hand out a fresh token
    fn fresh_run_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.run_token), token.clone());
        previous.cancel();
        for (_, plugin_token) in lock(&self.plugin_tokens).drain() {
            plugin_token.cancel();
        }
        lock(&self.live).clear();
        token
    }

    fn endpoint_id_for(&self, plugin: &str) -> String {
        match self.mode {
            BridgeMode::Bridge => bridge_endpoint_id(),
            BridgeMode::ChildBridge => plugin_endpoint_id(plugin),
        }
    }

    // ---- startup ------------------------------------------------------------

    /// Load and start every enabled plugin and bring up the endpoints.
    ///
    /// Returns once supervision has finished and endpoints are started. The
    /// deferred configure and reachable timers keep running afterwards.
    pub async fn startup(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::KernelLifecycleError {
                phase: crate::kernel::error::KernelLifecyclePhase::Start,
                component_name: Some(self.name.to_string()),
                message: "orchestrator is shutting down".to_string(),
                source: None,
            });
        }
        let token = self.fresh_run_token();
        let plugins = self.manager.enabled_names().await;
        log::info!(
            "Starting {} enabled plugin(s) in {} mode",
            plugins.len(),
            self.mode
        );
        match self.mode {
            BridgeMode::Bridge => self.startup_bridge(plugins, token).await,
            BridgeMode::ChildBridge => self.startup_childbridge(plugins, token).await,
        }
    }

    async fn startup_bridge(&self, plugins: Vec<String>, token: CancellationToken) -> Result<()> {
        let bridge = bridge_endpoint_id();
        self.endpoints.create(&bridge, EndpointOwner::Bridge, true).await?;

        for plugin in &plugins {
            let manager = self.manager.clone();
            let plugin = plugin.clone();
            self.track(tokio::spawn(async move { load_and_start(&manager, &plugin).await }));
        }

        let outcome = Supervisor::new(self.manager.clone(), plugins.clone(), &self.timing, token.child_token())
            .run()
            .await;
        match outcome {
            SupervisionOutcome::AllStarted => {}
            SupervisionOutcome::Cancelled => {
                log::info!("Bridge startup cancelled");
                return Ok(());
            }
            SupervisionOutcome::Errored { plugin, reason } => {
                log::error!(
                    "Plugin '{}' failed during startup: {}. The bridge will not be started so controllers never see a partial device set.",
                    plugin,
                    reason
                );
                self.bus
                    .publish(SystemEvent::StartupAborted.message(json!({ "plugin": plugin, "reason": reason })))
                    .await;
                return Err(Error::StartupAborted { plugin, reason });
            }
        }

        for plugin in &plugins {
            self.manager.attach_endpoint(plugin, &bridge, true).await;
        }
        self.endpoints.start(&bridge).await?;
        {
            let mut live = lock(&self.live);
            live.extend(plugins.iter().cloned());
        }
        log::info!("Bridge started with {} plugin(s)", plugins.len());
        self.spawn_timers(plugins, vec![bridge], token);
        Ok(())
    }

    async fn startup_childbridge(&self, plugins: Vec<String>, token: CancellationToken) -> Result<()> {
        let Some(orchestrator) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let mut sequences = Vec::new();
        for plugin in plugins {
            let plugin_token = token.child_token();
            lock(&self.plugin_tokens).insert(plugin.clone(), plugin_token.clone());
            let orchestrator = orchestrator.clone();
            sequences.push(tokio::spawn(async move {
                orchestrator.childbridge_sequence(plugin, plugin_token).await
            }));
        }
        for sequence in sequences {
            if let Err(e) = sequence.await {
                log::error!("Childbridge startup sequence failed: {}", e);
            }
        }
        Ok(())
    }

    /// One plugin's startup in childbridge topology; failures stay isolated
    async fn childbridge_sequence(self: Arc<Self>, plugin: String, token: CancellationToken) {
        let endpoint = plugin_endpoint_id(&plugin);
        let worker = {
            let orchestrator = self.clone();
            let plugin = plugin.clone();
            tokio::spawn(async move { load_and_start(&orchestrator.manager, &plugin).await })
        };
        self.track(worker);

        let outcome = Supervisor::new(self.manager.clone(), vec![plugin.clone()], &self.timing, token.child_token())
            .run()
            .await;
        match outcome {
            SupervisionOutcome::AllStarted => {}
            SupervisionOutcome::Cancelled => return,
            SupervisionOutcome::Errored { reason, .. } => {
                log::error!("Plugin '{}' failed during startup and is isolated: {}", plugin, reason);
                if let Err(e) = self.endpoints.teardown(&endpoint).await {
                    log::warn!("Tearing down endpoint of plugin '{}' failed: {}", plugin, e);
                }
                self.devices.remove_plugin(&plugin);
                return;
            }
        }

        if let Err(e) = self.prepare_plugin_endpoint(&plugin).await {
            log::error!("Endpoint of plugin '{}' could not be created: {}", plugin, e);
            if let Err(e) = self.manager.mark_errored(&plugin, &e.to_string()).await {
                log::warn!("{}", e);
            }
            return;
        }
        lock(&self.live).insert(plugin.clone());
        if self.endpoints.exists(&endpoint).await {
            if let Err(e) = self.endpoints.start(&endpoint).await {
                log::error!("Endpoint of plugin '{}' failed to start: {}", plugin, e);
                if let Err(e) = self.manager.mark_errored(&plugin, &e.to_string()).await {
                    log::warn!("{}", e);
                }
                return;
            }
        }
        log::info!("Child bridge of plugin '{}' started", plugin);
        self.spawn_timers(vec![plugin], vec![endpoint], token);
    }

    /// A started dynamic platform always gets its endpoint, with or without devices
    async fn prepare_plugin_endpoint(&self, plugin: &str) -> std::result::Result<(), PluginSystemError> {
        let platform_type = self.manager.platform_type(plugin).await.unwrap_or_default();
        if platform_type == PlatformType::AccessoryPlatform {
            return Ok(());
        }
        let owner = EndpointOwner::Plugin {
            plugin: plugin.to_string(),
        };
        self.ensure_endpoint(plugin, &plugin_endpoint_id(plugin), owner, true)
            .await
            .map(|_| ())
    }

    fn spawn_timers(&self, plugins: Vec<String>, endpoints: Vec<String>, token: CancellationToken) {
        let manager = self.manager.clone();
        let configure_token = token.clone();
        let configure_delay = self.timing.configure_delay;
        let configure_plugins = plugins;
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = configure_token.cancelled() => return,
                _ = tokio::time::sleep(configure_delay) => {}
            }
            for plugin in configure_plugins {
                if manager.status(&plugin).await != Some(PluginStatus::Started) {
                    continue;
                }
                if let Err(e) = manager.configure(&plugin).await {
                    log::warn!("Configuring plugin '{}' failed: {}", plugin, e);
                }
            }
        }));

        let lifecycle = self.endpoints.clone();
        let reachable_delay = self.timing.reachable_delay;
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(reachable_delay) => {}
            }
            lifecycle.announce_reachable(&endpoints).await;
        }));
    }

    // ---- endpoints for device contributions -----------------------------------

    /// Return the endpoint id, creating the endpoint under the plugin's
    /// construction lock when it does not exist yet
    async fn ensure_endpoint(
        &self,
        plugin: &str,
        id: &str,
        owner: EndpointOwner,
        aggregator: bool,
    ) -> std::result::Result<String, PluginSystemError> {
        if self.endpoints.exists(id).await {
            return Ok(id.to_string());
        }

        let mut waited = Duration::ZERO;
        while !self.manager.try_lock(plugin).await? {
            if self.endpoints.exists(id).await {
                return Ok(id.to_string());
            }
            if waited >= CONSTRUCTION_WAIT {
                return Err(PluginSystemError::precondition(
                    plugin,
                    "create endpoint",
                    "endpoint construction is still in progress",
                ));
            }
            tokio::time::sleep(CONSTRUCTION_POLL).await;
            waited += CONSTRUCTION_POLL;
        }

        let result = self.construct_endpoint(plugin, id, owner, aggregator).await;
        self.manager.unlock(plugin).await;
        result
    }

    async fn construct_endpoint(
        &self,
        plugin: &str,
        id: &str,
        owner: EndpointOwner,
        aggregator: bool,
    ) -> std::result::Result<String, PluginSystemError> {
        self.endpoints
            .create(id, owner, aggregator)
            .await
            .map_err(|e| endpoint_failure(plugin, "create endpoint", e))?;
        self.manager.attach_endpoint(plugin, id, aggregator).await;
        let start_now = lock(&self.live).contains(plugin);
        if start_now {
            self.endpoints
                .start(id)
                .await
                .map_err(|e| endpoint_failure(plugin, "start endpoint", e))?;
        }
        Ok(id.to_string())
    }

    async fn endpoint_for_device(
        &self,
        plugin: &str,
        platform_type: PlatformType,
        device: &BridgedDevice,
    ) -> std::result::Result<String, PluginSystemError> {
        match (self.mode, platform_type) {
            (BridgeMode::Bridge, _) => {
                let id = bridge_endpoint_id();
                if !self.endpoints.exists(&id).await {
                    self.endpoints
                        .create(&id, EndpointOwner::Bridge, true)
                        .await
                        .map_err(|e| endpoint_failure(plugin, "create endpoint", e))?;
                }
                self.manager.attach_endpoint(plugin, &id, true).await;
                Ok(id)
            }
            (BridgeMode::ChildBridge, PlatformType::AccessoryPlatform) => {
                let owner = EndpointOwner::Device {
                    plugin: plugin.to_string(),
                    device: device.id.clone(),
                };
                self.ensure_endpoint(plugin, &plugin_endpoint_id(plugin), owner, false).await
            }
            (BridgeMode::ChildBridge, _) => {
                let owner = EndpointOwner::Plugin {
                    plugin: plugin.to_string(),
                };
                self.ensure_endpoint(plugin, &plugin_endpoint_id(plugin), owner, true).await
            }
        }
    }

    async fn sync_device_counts(&self, plugin: &str) {
        let (registered, added) = self.devices.counts(plugin);
        self.manager.set_device_counts(plugin, registered, added).await;
    }

    // ---- shutdown -----------------------------------------------------------

    /// Ordered teardown. Only the first call does anything.
    pub async fn shutdown(&self, restart: bool) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            log::debug!("Shutdown already in progress");
            return Ok(());
        }
        log::info!("Shutting down{}", if restart { " for restart" } else { "" });

        lock(&self.run_token).cancel();
        for (_, token) in lock(&self.plugin_tokens).drain() {
            token.cancel();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let reason = if restart {
            LifecycleReason::Restart
        } else {
            LifecycleReason::Shutdown
        };
        for plugin in self.manager.enabled_names().await {
            match self.manager.status(&plugin).await {
                Some(PluginStatus::Errored) | Some(PluginStatus::Unregistered) | None => continue,
                Some(_) => {}
            }
            let unregister = self
                .manager
                .plugin_config(&plugin)
                .await
                .and_then(|config| config.get("unregisterOnShutdown").and_then(Value::as_bool))
                .unwrap_or(false);
            let options = ShutdownOptions::new(reason).remove_devices(unregister);
            if let Err(e) = self.manager.shutdown(&plugin, options).await {
                log::warn!("Shutting down plugin '{}' failed: {}", plugin, e);
            }
        }

        if let Some(frontend) = &self.frontend {
            if let Err(e) = frontend.stop().await {
                log::warn!("Stopping frontend '{}' failed: {}", frontend.name(), e);
            }
        }

        self.endpoints.stop_all().await;
        self.endpoints.close_storage_all().await;

        let mut namespaces = self.store.open_namespaces().await;
        namespaces.retain(|namespace| namespace != constants::CORE_CONTEXT);
        for namespace in namespaces {
            if let Err(e) = self.store.close_context(&namespace).await {
                log::warn!("Closing storage context '{}' failed: {}", namespace, e);
            }
        }
        if let Err(e) = self.store.close_context(constants::CORE_CONTEXT).await {
            log::error!("Closing storage context '{}' failed: {}", constants::CORE_CONTEXT, e);
        }

        self.manager.clear_registry().await;
        self.devices.clear();
        self.endpoints.clear().await;

        let terminal = if restart { SystemEvent::Restart } else { SystemEvent::Shutdown };
        self.bus.publish(terminal.message(json!({}))).await;
        log::info!("Shutdown complete");
        Ok(())
    }

    fn attach_bus(&self) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_none() {
            let handler = Arc::new(CoreEventHandler {
                orchestrator: self.self_ref.clone(),
            });
            *subscription = Some(self.bus.subscribe(constants::CORE_CHANNEL, handler));
        }
    }
}

async fn load_and_start(manager: &PluginManager, plugin: &str) {
    if let Err(e) = manager.load(plugin).await {
        log::debug!("Load of '{}' did not complete: {}", plugin, e);
        return;
    }
    if let Err(e) = manager.start(plugin, LifecycleReason::Startup).await {
        log::debug!("Start of '{}' did not complete: {}", plugin, e);
    }
}

/// Listens on the core channel for requests to restart
struct CoreEventHandler {
    orchestrator: Weak<BridgeOrchestrator>,
}

#[async_trait]
impl BusHandler for CoreEventHandler {
    async fn handle(&self, message: &Message) -> Option<Value> {
        if message.is_request() {
            return None;
        }
        if message.message_type == SystemEvent::RestartRequired.name() {
            if let Some(orchestrator) = self.orchestrator.upgrade() {
                log::warn!("Restart requested by {}", message.src);
                orchestrator.request_restart();
            }
        }
        None
    }
}

#[async_trait]
impl DeviceHost for BridgeOrchestrator {
    async fn register_device(&self, plugin: &str, device: BridgedDevice) -> std::result::Result<(), PluginSystemError> {
        if self.is_shutting_down() {
            return Err(PluginSystemError::precondition(plugin, "register device", "bridge is shutting down"));
        }
        let platform_type = self
            .manager
            .platform_type(plugin)
            .await
            .ok_or_else(|| PluginSystemError::not_found(plugin))?;
        if platform_type == PlatformType::AccessoryPlatform
            && !self.devices.of_plugin(plugin).is_empty()
            && !self.devices.has(plugin, &device.id)
        {
            return Err(PluginSystemError::precondition(
                plugin,
                "register device",
                "an accessory platform contributes exactly one device",
            ));
        }

        let endpoint = self.endpoint_for_device(plugin, platform_type, &device).await?;
        let device_id = device.id.clone();
        self.devices.insert(device.clone(), &endpoint);
        let added = self.endpoints.add_device(&endpoint, device).await;
        if added.is_ok() {
            self.devices.mark_added(plugin, &device_id);
        }
        self.sync_device_counts(plugin).await;
        added.map_err(|e| endpoint_failure(plugin, "add device", e))?;
        log::info!("Plugin '{}' added device '{}' to endpoint '{}'", plugin, device_id, endpoint);
        Ok(())
    }

    async fn unregister_device(&self, plugin: &str, device_id: &str) -> std::result::Result<(), PluginSystemError> {
        let entry = self.devices.remove(plugin, device_id).ok_or_else(|| {
            PluginSystemError::precondition(plugin, "unregister device", format!("unknown device '{}'", device_id))
        })?;
        self.sync_device_counts(plugin).await;
        if entry.added {
            self.endpoints
                .remove_device(&entry.endpoint, plugin, device_id)
                .await
                .map_err(|e| endpoint_failure(plugin, "remove device", e))?;
        }
        log::info!("Plugin '{}' removed device '{}'", plugin, device_id);
        Ok(())
    }

    async fn remove_all_devices(&self, plugin: &str) -> std::result::Result<usize, PluginSystemError> {
        let entries = self.devices.remove_plugin(plugin);
        self.sync_device_counts(plugin).await;
        for entry in entries.iter().filter(|entry| entry.added) {
            if let Err(e) = self
                .endpoints
                .remove_device(&entry.endpoint, plugin, &entry.device.id)
                .await
            {
                log::warn!("Removing device '{}' of plugin '{}' failed: {}", entry.device.id, plugin, e);
            }
        }
        Ok(entries.len())
    }

    async fn release_plugin(&self, plugin: &str) -> std::result::Result<(), PluginSystemError> {
        if self.is_shutting_down() {
            return Ok(());
        }
        lock(&self.live).remove(plugin);
        if let Some(token) = lock(&self.plugin_tokens).remove(plugin) {
            token.cancel();
        }
        if self.mode == BridgeMode::ChildBridge {
            let endpoint = self.endpoint_id_for(plugin);
            self.devices.remove_plugin(plugin);
            self.endpoints
                .teardown(&endpoint)
                .await
                .map_err(|e| endpoint_failure(plugin, "tear down endpoint", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl KernelComponent for BridgeOrchestrator {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.devices.attach_bus(&self.bus);
        self.attach_bus();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if let Some(frontend) = &self.frontend {
            frontend.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown(false).await?;
        self.devices.detach_bus(&self.bus);
        if let Some(id) = lock(&self.subscription).take() {
            let _ = self.bus.unsubscribe(id);
        }
        Ok(())
    }
}
