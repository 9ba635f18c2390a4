use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bridge::devices::DeviceRegistry;
use crate::bridge::mode::{BridgeOverrides, BridgeSettings};
use crate::bridge::orchestrator::{BridgeOrchestrator, OrchestratorOptions};
use crate::endpoint::lifecycle::EndpointLifecycle;
use crate::endpoint::record::{bridge_endpoint_id, plugin_endpoint_id};
use crate::endpoint::server::{LocalServerFactory, ServerNodeFactory};
use crate::event::BroadcastBus;
use crate::frontend::{ConsoleFrontend, Frontend};
use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::{Error, KernelLifecyclePhase, Result};
use crate::plugin_system::config::PluginConfigLoader;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::loader::PlatformLoader;
use crate::plugin_system::manager::{PluginManager, PluginManagerOptions};
use crate::plugin_system::package::{CommandPackageManager, PackageManager};
use crate::storage::config::ConfigScope;
use crate::storage::manager::DefaultStorageManager;

/// Why [`Application::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    /// The process should bootstrap a fresh application and run again
    Restart,
}

/// Everything needed to assemble an [`Application`]
pub struct ApplicationOptions {
    /// Home directory; falls back to `MBRIDGE_HOME`, then `~/.mbridge`
    pub home: Option<PathBuf>,
    pub overrides: BridgeOverrides,
    pub loader: Arc<dyn PlatformLoader>,
    /// Defaults to npm installing into `<home>/plugins`
    pub packages: Option<Arc<dyn PackageManager>>,
    /// Defaults to the in-process [`LocalServerFactory`]
    pub server_factory: Option<Arc<dyn ServerNodeFactory>>,
    /// Attach the console presentation layer
    pub console: bool,
    /// Plugin configuration templates by plugin name
    pub templates: Vec<(String, Value)>,
}

impl ApplicationOptions {
    pub fn new(loader: Arc<dyn PlatformLoader>) -> Self {
        Self {
            home: None,
            overrides: BridgeOverrides::default(),
            loader,
            packages: None,
            server_factory: None,
            console: false,
            templates: Vec::new(),
        }
    }

    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn overrides(mut self, overrides: BridgeOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn packages(mut self, packages: Arc<dyn PackageManager>) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn server_factory(mut self, factory: Arc<dyn ServerNodeFactory>) -> Self {
        self.server_factory = Some(factory);
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn template(mut self, plugin: &str, template: Value) -> Self {
        self.templates.push((plugin.to_string(), template));
        self
    }
}

/// Root of one process run. Owns every component; nothing is global.
///
/// Components are initialized in construction order (storage, bus, plugin
/// manager, orchestrator) and stopped in reverse.
pub struct Application {
    initialized: AtomicBool,
    closed: AtomicBool,
    settings: BridgeSettings,
    storage: Arc<DefaultStorageManager>,
    bus: Arc<BroadcastBus>,
    manager: Arc<PluginManager>,
    endpoints: Arc<EndpointLifecycle>,
    devices: Arc<DeviceRegistry>,
    orchestrator: Arc<BridgeOrchestrator>,
    components: Vec<Arc<dyn KernelComponent>>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("home", &self.storage.home())
            .field("settings", &self.settings)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Resolve settings and wire every component together. Nothing is loaded yet.
    pub async fn bootstrap(options: ApplicationOptions) -> Result<Self> {
        log::info!("Bootstrapping {} v{}", constants::APP_NAME, constants::APP_VERSION);

        let home = DefaultStorageManager::resolve_home(options.home)?;
        let storage = Arc::new(DefaultStorageManager::new(home));
        storage.ensure_directories()?;
        let store = storage.store();

        let app_config = storage
            .config_manager()
            .load_config(constants::APP_CONFIG_NAME, ConfigScope::Application)?;
        let core = store.context(constants::CORE_CONTEXT).await?;
        let settings = BridgeSettings::resolve(&options.overrides, &app_config, &core).await?;
        log::debug!("Resolved settings: {:?}", settings);

        let bus = Arc::new(BroadcastBus::with_timeout(settings.timing.request_timeout));

        let mut configs = PluginConfigLoader::new(storage.config_manager().clone());
        for (plugin, template) in options.templates {
            configs.add_template(&plugin, template);
        }
        let packages = options
            .packages
            .unwrap_or_else(|| Arc::new(CommandPackageManager::npm(storage.plugins_dir())) as Arc<dyn PackageManager>);
        let mut plugin_dirs = settings.plugin_dirs.clone();
        plugin_dirs.push(storage.plugins_dir());
        plugin_dirs.push(storage.plugins_dir().join("node_modules"));

        let manager = PluginManager::new(PluginManagerOptions {
            store: store.clone(),
            loader: options.loader,
            packages,
            bus: bus.clone(),
            configs,
            plugin_dirs,
        });

        let factory = options
            .server_factory
            .unwrap_or_else(|| Arc::new(LocalServerFactory::new()) as Arc<dyn ServerNodeFactory>);
        let endpoints = EndpointLifecycle::new(store.clone(), factory, bus.clone(), manager.clone(), settings.endpoint);
        let devices = Arc::new(DeviceRegistry::new());

        let frontend = options
            .console
            .then(|| ConsoleFrontend::new(bus.clone()) as Arc<dyn Frontend>);

        let orchestrator = BridgeOrchestrator::new(OrchestratorOptions {
            mode: settings.mode,
            timing: settings.timing,
            manager: manager.clone(),
            endpoints: endpoints.clone(),
            devices: devices.clone(),
            bus: bus.clone(),
            store,
            frontend,
        });

        let components: Vec<Arc<dyn KernelComponent>> = vec![
            storage.clone() as Arc<dyn KernelComponent>,
            bus.clone() as Arc<dyn KernelComponent>,
            manager.clone() as Arc<dyn KernelComponent>,
            orchestrator.clone() as Arc<dyn KernelComponent>,
        ];

        Ok(Self {
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            settings,
            storage,
            bus,
            manager,
            endpoints,
            devices,
            orchestrator,
            components,
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn home(&self) -> &Path {
        self.storage.home()
    }

    pub fn storage(&self) -> &Arc<DefaultStorageManager> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    pub fn plugin_manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn endpoints(&self) -> &Arc<EndpointLifecycle> {
        &self.endpoints
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn orchestrator(&self) -> &Arc<BridgeOrchestrator> {
        &self.orchestrator
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Initialize every component in order. The registry is read from storage here.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for component in &self.components {
            log::debug!("Initializing component: {}", component.name());
            component.initialize().await.map_err(|e| Error::KernelLifecycleError {
                phase: KernelLifecyclePhase::Initialize,
                component_name: Some(component.name().to_string()),
                message: "component failed to initialize".to_string(),
                source: Some(Box::new(e)),
            })?;
        }
        Ok(())
    }

    async fn start_components(&self) -> Result<()> {
        for component in &self.components {
            log::debug!("Starting component: {}", component.name());
            component.start().await.map_err(|e| Error::KernelLifecycleError {
                phase: KernelLifecyclePhase::Start,
                component_name: Some(component.name().to_string()),
                message: "component failed to start".to_string(),
                source: Some(Box::new(e)),
            })?;
        }
        Ok(())
    }

    /// Orchestrate until `cancel` fires or a restart is requested.
    ///
    /// An aborted bridge startup is logged and the process stays up until
    /// it is told to stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExitReason> {
        self.initialize().await?;
        self.start_components().await?;

        let startup = tokio::select! {
            result = self.orchestrator.startup() => Some(result),
            _ = cancel.cancelled() => None,
        };
        match startup {
            Some(Ok(())) | None => {}
            Some(Err(Error::StartupAborted { plugin, reason })) => {
                log::error!(
                    "Startup aborted by plugin '{}': {}. Fix or disable the plugin and restart.",
                    plugin,
                    reason
                );
            }
            Some(Err(e)) => {
                self.close().await?;
                return Err(e);
            }
        }

        let reason = tokio::select! {
            _ = cancel.cancelled() => ExitReason::Shutdown,
            _ = self.orchestrator.restart_requested() => ExitReason::Restart,
        };
        log::info!("Leaving orchestration: {:?}", reason);
        self.orchestrator.shutdown(reason == ExitReason::Restart).await?;
        self.close().await?;
        Ok(reason)
    }

    /// Stop every component in reverse order. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for component in self.components.iter().rev() {
            log::debug!("Stopping component: {}", component.name());
            if let Err(e) = component.stop().await {
                log::error!("Error stopping component {}: {}", component.name(), e);
                first_error.get_or_insert(Error::KernelLifecycleError {
                    phase: KernelLifecyclePhase::Shutdown,
                    component_name: Some(component.name().to_string()),
                    message: "component failed to stop".to_string(),
                    source: Some(Box::new(e)),
                });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Clear a network identity: the shared bridge's, or a plugin's own
    pub async fn reset(&self, plugin: Option<&str>) -> Result<String> {
        self.initialize().await?;
        let id = match plugin {
            None => bridge_endpoint_id(),
            Some(target) => {
                let name = match self.manager.get(target).await {
                    Some(snapshot) => snapshot.name,
                    None => match self.manager.resolve(target) {
                        Ok(resolved) => resolved.manifest.name,
                        Err(e) => {
                            log::debug!("Reset target '{}' does not resolve to a plugin: {}", target, e);
                            return Err(PluginSystemError::not_found(target).into());
                        }
                    },
                };
                if !self.manager.has(&name).await {
                    return Err(PluginSystemError::not_found(&name).into());
                }
                plugin_endpoint_id(&name)
            }
        };
        self.endpoints.reset_identity(&id).await?;
        Ok(id)
    }

    /// Remove every persisted context and configuration file
    pub async fn factory_reset(&self) -> Result<()> {
        self.storage.factory_reset().await?;
        Ok(())
    }
}
