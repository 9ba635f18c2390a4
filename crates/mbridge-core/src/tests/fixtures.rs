//! Platforms, package managers and wiring shared by the unit and integration tests
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::bridge::devices::DeviceRegistry;
use crate::bridge::mode::{BridgeMode, TimingSettings};
use crate::bridge::orchestrator::{BridgeOrchestrator, OrchestratorOptions};
use crate::endpoint::lifecycle::EndpointLifecycle;
use crate::endpoint::record::EndpointDefaults;
use crate::endpoint::server::LocalServerFactory;
use crate::event::BroadcastBus;
use crate::kernel::bootstrap::ApplicationOptions;
use crate::kernel::constants;
use crate::plugin_system::config::PluginConfigLoader;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::loader::StaticPlatformLoader;
use crate::plugin_system::manager::{PluginManager, PluginManagerOptions};
use crate::plugin_system::package::PackageManager;
use crate::plugin_system::registry::PluginStatus;
use crate::plugin_system::traits::{
    BridgeHandle, BridgedDevice, LifecycleReason, Platform, PlatformContext, PlatformError, PlatformType,
};
use crate::storage::context::PersistenceStore;
use crate::storage::manager::DefaultStorageManager;

/// Entry point every test manifest points at
pub const TEST_ENTRY: &str = "test-platform";

/// What a hook does when it runs
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Outcome {
    #[default]
    Succeed,
    Fail(String),
    Panic,
    /// Succeeds after sleeping
    Delay(Duration),
    /// Never returns within a test's lifetime
    Hang,
}

impl Outcome {
    pub fn fail(message: &str) -> Self {
        Outcome::Fail(message.to_string())
    }

    async fn apply(&self, plugin: &str, hook: &str) -> Result<(), PlatformError> {
        match self {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(message) => Err(PlatformError(message.clone())),
            Outcome::Panic => panic!("{} panicked in {}", plugin, hook),
            Outcome::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub platform_type: PlatformType,
    pub instantiate: Outcome,
    pub start: Outcome,
    pub configure: Outcome,
    pub shutdown: Outcome,
    /// Registered through the bridge handle at the end of a successful start
    pub devices: Vec<BridgedDevice>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            platform_type: PlatformType::DynamicPlatform,
            instantiate: Outcome::Succeed,
            start: Outcome::Succeed,
            configure: Outcome::Succeed,
            shutdown: Outcome::Succeed,
            devices: Vec::new(),
        }
    }
}

impl Behavior {
    pub fn accessory(device: BridgedDevice) -> Self {
        Self {
            platform_type: PlatformType::AccessoryPlatform,
            devices: vec![device],
            ..Self::default()
        }
    }

    pub fn dynamic(devices: Vec<BridgedDevice>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }
}

/// Per-plugin behaviors plus a journal of every hook call, `<plugin>:<hook>[:<reason>]`
#[derive(Debug, Default)]
pub struct Behaviors {
    behaviors: Mutex<HashMap<String, Behavior>>,
    journal: Mutex<Vec<String>>,
}

impl Behaviors {
    pub fn set(&self, plugin: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(plugin.to_string(), behavior);
    }

    pub fn get(&self, plugin: &str) -> Behavior {
        self.behaviors.lock().unwrap().get(plugin).cloned().unwrap_or_default()
    }

    pub fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.journal.lock().unwrap().iter().filter(|e| e.as_str() == entry).count()
    }
}

pub struct TestPlatform {
    name: String,
    behavior: Behavior,
    bridge: BridgeHandle,
    behaviors: Arc<Behaviors>,
}

#[async_trait]
impl Platform for TestPlatform {
    fn platform_type(&self) -> PlatformType {
        self.behavior.platform_type
    }

    async fn on_start(&self, reason: LifecycleReason) -> Result<(), PlatformError> {
        self.behaviors.record(format!("{}:start:{}", self.name, reason));
        self.behavior.start.apply(&self.name, "start").await?;
        for device in &self.behavior.devices {
            self.bridge.register_device(device.clone()).await?;
        }
        Ok(())
    }

    async fn on_configure(&self) -> Result<(), PlatformError> {
        self.behaviors.record(format!("{}:configure", self.name));
        self.behavior.configure.apply(&self.name, "configure").await
    }

    async fn on_shutdown(&self, reason: LifecycleReason) -> Result<(), PlatformError> {
        self.behaviors.record(format!("{}:shutdown:{}", self.name, reason));
        self.behavior.shutdown.apply(&self.name, "shutdown").await
    }
}

/// Loader with [`TEST_ENTRY`] registered; each plugin behaves as configured in `behaviors`
pub fn test_loader(behaviors: Arc<Behaviors>) -> StaticPlatformLoader {
    let mut loader = StaticPlatformLoader::new();
    loader.register(TEST_ENTRY, move |context: PlatformContext| {
        let behavior = behaviors.get(&context.name);
        behaviors.record(format!("{}:instantiate", context.name));
        match &behavior.instantiate {
            Outcome::Fail(message) => return Err(PlatformError(message.clone())),
            Outcome::Panic => panic!("{} panicked while instantiating", context.name),
            _ => {}
        }
        let platform: Arc<dyn Platform> = Arc::new(TestPlatform {
            name: context.name.clone(),
            behavior,
            bridge: context.bridge.clone(),
            behaviors: behaviors.clone(),
        });
        Ok(platform)
    });
    loader
}

/// Write `<dir>/<name>/plugin.json`. `entry: None` leaves the entry point out.
pub fn write_plugin(dir: &Path, name: &str, entry: Option<&str>) -> PathBuf {
    let plugin_dir = dir.join(name);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let mut manifest = json!({
        "name": name,
        "version": "1.0.0",
        "description": format!("{} test plugin", name),
        "kind": "platform",
        "compatibility": ">=1.0.0, <2.0.0",
    });
    if let Some(entry) = entry {
        manifest["entry"] = json!(entry);
    }
    std::fs::write(
        plugin_dir.join(constants::PLUGIN_MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    plugin_dir
}

pub fn device(id: &str) -> BridgedDevice {
    BridgedDevice::new(id, format!("Device {}", id), "light")
}

/// Package manager that "installs" by writing a manifest into the plugin directory
#[derive(Debug)]
pub struct FakePackageManager {
    plugins_dir: PathBuf,
    fail: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl FakePackageManager {
    pub fn new(plugins_dir: PathBuf) -> Self {
        Self {
            plugins_dir,
            fail: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, operation: &str, package: &str) -> Result<(), PluginSystemError> {
        if *self.fail.lock().unwrap() {
            return Err(PluginSystemError::PackageFailed {
                package: package.to_string(),
                operation: operation.to_string(),
                message: "exit status 1".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn install(&self, package: &str) -> Result<(), PluginSystemError> {
        self.calls.lock().unwrap().push(format!("install {}", package));
        self.check("install", package)?;
        if package != constants::CORE_PACKAGE_NAME {
            write_plugin(&self.plugins_dir, package, Some(TEST_ENTRY));
        }
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<(), PluginSystemError> {
        self.calls.lock().unwrap().push(format!("uninstall {}", package));
        self.check("uninstall", package)?;
        let _ = std::fs::remove_dir_all(self.plugins_dir.join(package));
        Ok(())
    }
}

/// Timing short enough for tests
pub fn fast_timing() -> TimingSettings {
    TimingSettings {
        supervision_interval: Duration::from_millis(10),
        failure_ceiling: 20,
        configure_delay: Duration::from_millis(40),
        reachable_delay: Duration::from_millis(80),
        request_timeout: Duration::from_millis(500),
    }
}

/// Application configuration with test timing, written under `home`
pub fn write_fast_app_config(home: &Path, mode: Option<&str>) {
    let dir = home.join(constants::APP_CONFIG_DIR);
    std::fs::create_dir_all(&dir).unwrap();
    let mut config = json!({
        "timing": {
            "supervisionIntervalMs": 10,
            "failureCeiling": 20,
            "configureDelayMs": 40,
            "reachableDelayMs": 80,
            "requestTimeoutMs": 500
        }
    });
    if let Some(mode) = mode {
        config["mode"] = json!(mode);
    }
    std::fs::write(
        dir.join(format!("{}.json", constants::APP_CONFIG_NAME)),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
}

/// Application wiring over `home` with the test loader, a fake package
/// manager and in-process server nodes
pub fn app_options(
    home: &Path,
    behaviors: Arc<Behaviors>,
    factory: Arc<LocalServerFactory>,
) -> (ApplicationOptions, Arc<FakePackageManager>) {
    let packages = Arc::new(FakePackageManager::new(home.join(constants::PLUGINS_DIR)));
    let options = ApplicationOptions::new(Arc::new(test_loader(behaviors)))
        .home(home)
        .packages(packages.clone())
        .server_factory(factory);
    (options, packages)
}

/// A plugin manager over a temporary home
pub struct Harness {
    pub temp: TempDir,
    pub plugins_dir: PathBuf,
    pub storage: Arc<DefaultStorageManager>,
    pub store: Arc<dyn PersistenceStore>,
    pub bus: Arc<BroadcastBus>,
    pub behaviors: Arc<Behaviors>,
    pub packages: Arc<FakePackageManager>,
    pub manager: Arc<PluginManager>,
}

impl Harness {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("Failed to create temp directory");
        Self::at(temp)
    }

    /// Build over an existing home, e.g. to observe what another harness persisted
    pub fn at(temp: TempDir) -> Self {
        let storage = Arc::new(DefaultStorageManager::new(temp.path().to_path_buf()));
        storage.ensure_directories().unwrap();
        let plugins_dir = storage.plugins_dir();
        let store = storage.store();
        let bus = Arc::new(BroadcastBus::with_timeout(Duration::from_millis(500)));
        let behaviors = Arc::new(Behaviors::default());
        let packages = Arc::new(FakePackageManager::new(plugins_dir.clone()));
        let manager = PluginManager::new(PluginManagerOptions {
            store: store.clone(),
            loader: Arc::new(test_loader(behaviors.clone())),
            packages: packages.clone(),
            bus: bus.clone(),
            configs: PluginConfigLoader::new(storage.config_manager().clone()),
            plugin_dirs: vec![plugins_dir.clone()],
        });
        Self {
            temp,
            plugins_dir,
            storage,
            store,
            bus,
            behaviors,
            packages,
            manager,
        }
    }

    pub fn home(&self) -> &Path {
        self.temp.path()
    }

    /// Write a loadable plugin and register it
    pub async fn add_plugin(&self, name: &str, behavior: Behavior) {
        self.behaviors.set(name, behavior);
        write_plugin(&self.plugins_dir, name, Some(TEST_ENTRY));
        self.manager.add(name).await.unwrap();
    }

    pub async fn status(&self, name: &str) -> Option<PluginStatus> {
        self.manager.status(name).await
    }

    pub fn endpoints(&self, factory: Arc<LocalServerFactory>) -> Arc<EndpointLifecycle> {
        EndpointLifecycle::new(
            self.store.clone(),
            factory,
            self.bus.clone(),
            self.manager.clone(),
            EndpointDefaults::default(),
        )
    }

    pub fn orchestrator(&self, mode: BridgeMode) -> Topology {
        self.orchestrator_over(mode, self.store.clone())
    }

    /// Like [`Harness::orchestrator`], with the orchestrator's own store swapped out
    pub fn orchestrator_over(&self, mode: BridgeMode, store: Arc<dyn PersistenceStore>) -> Topology {
        let factory = Arc::new(LocalServerFactory::new());
        let endpoints = self.endpoints(factory.clone());
        let devices = Arc::new(DeviceRegistry::new());
        let orchestrator = BridgeOrchestrator::new(OrchestratorOptions {
            mode,
            timing: fast_timing(),
            manager: self.manager.clone(),
            endpoints: endpoints.clone(),
            devices: devices.clone(),
            bus: self.bus.clone(),
            store,
            frontend: None,
        });
        Topology {
            orchestrator,
            factory,
            endpoints,
            devices,
        }
    }
}

/// An orchestrator with handles on everything it drives
pub struct Topology {
    pub orchestrator: Arc<BridgeOrchestrator>,
    pub factory: Arc<LocalServerFactory>,
    pub endpoints: Arc<EndpointLifecycle>,
    pub devices: Arc<DeviceRegistry>,
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}
