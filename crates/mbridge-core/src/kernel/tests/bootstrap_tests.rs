use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use crate::bridge::mode::{BridgeMode, BridgeOverrides};
use crate::endpoint::server::LocalServerFactory;
use crate::kernel::bootstrap::{Application, ExitReason};
use crate::kernel::constants;
use crate::kernel::error::Error;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::registry::PluginStatus;
use crate::tests::fixtures::{
    Behavior, Behaviors, Outcome, TEST_ENTRY, app_options, device, eventually, write_fast_app_config, write_plugin,
};

const WAIT: Duration = Duration::from_secs(3);

async fn bootstrap(home: &std::path::Path, behaviors: Arc<Behaviors>) -> (Application, Arc<LocalServerFactory>) {
    let factory = Arc::new(LocalServerFactory::new());
    let (options, _) = app_options(home, behaviors, factory.clone());
    (Application::bootstrap(options).await.unwrap(), factory)
}

/// Register plugins in a first application and close it again
async fn register(home: &std::path::Path, plugins: &[(&str, Behavior)], behaviors: &Arc<Behaviors>) {
    let (app, _) = bootstrap(home, behaviors.clone()).await;
    app.initialize().await.unwrap();
    for (name, behavior) in plugins {
        behaviors.set(name, behavior.clone());
        write_plugin(&home.join(constants::PLUGINS_DIR), name, Some(TEST_ENTRY));
        app.plugin_manager().add(name).await.unwrap();
    }
    app.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_prepares_home_without_loading_anything() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let (app, _) = bootstrap(temp_dir.path(), Arc::default()).await;

    for dir in ["config", "storage", "plugins"] {
        assert!(temp_dir.path().join(dir).is_dir(), "{} should exist", dir);
    }
    assert!(!app.is_initialized());
    assert_eq!(app.home(), temp_dir.path());
    assert_eq!(app.settings().mode, BridgeMode::Bridge);
    assert!(app.plugin_manager().is_empty().await);
}

#[tokio::test]
async fn test_mode_chosen_on_command_line_is_persisted() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let factory = Arc::new(LocalServerFactory::new());
    let (options, _) = app_options(temp_dir.path(), Arc::default(), factory);
    let options = options.overrides(BridgeOverrides {
        mode: Some(BridgeMode::ChildBridge),
        ..BridgeOverrides::default()
    });
    let app = Application::bootstrap(options).await.unwrap();
    assert_eq!(app.settings().mode, BridgeMode::ChildBridge);
    app.close().await.unwrap();

    let (again, _) = bootstrap(temp_dir.path(), Arc::default()).await;
    assert_eq!(again.settings().mode, BridgeMode::ChildBridge);
}

#[tokio::test]
async fn test_initialize_reads_registry_from_storage() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let behaviors = Arc::new(Behaviors::default());
    register(temp_dir.path(), &[("lights", Behavior::default())], &behaviors).await;

    let (app, _) = bootstrap(temp_dir.path(), behaviors).await;
    assert!(app.plugin_manager().is_empty().await);
    app.initialize().await.unwrap();
    app.initialize().await.unwrap();
    assert!(app.is_initialized());

    let lights = app.plugin_manager().get("lights").await.unwrap();
    assert!(lights.enabled);
    assert_eq!(lights.status, PluginStatus::Unregistered);
}

#[tokio::test]
async fn test_run_until_cancelled() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), None);
    let behaviors = Arc::new(Behaviors::default());
    register(temp_dir.path(), &[("lights", Behavior::dynamic(vec![device("l1")]))], &behaviors).await;
    let (app, factory) = bootstrap(temp_dir.path(), behaviors.clone()).await;
    let app = Arc::new(app);

    let cancel = CancellationToken::new();
    let runner = {
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(cancel).await })
    };

    let node_factory = factory.clone();
    assert!(
        eventually(WAIT, || {
            let factory = node_factory.clone();
            async move { factory.node("bridge").is_some_and(|node| node.is_reachable()) }
        })
        .await
    );
    assert_eq!(behaviors.count("lights:configure"), 1);

    cancel.cancel();
    let reason = runner.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::Shutdown);
    assert_eq!(behaviors.count("lights:shutdown:shutdown"), 1);
    assert!(!factory.node("bridge").unwrap().is_running());
    app.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_bridge_startup_keeps_running_until_cancelled() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), None);
    let behaviors = Arc::new(Behaviors::default());
    let broken = Behavior {
        start: Outcome::fail("no hub"),
        ..Behavior::default()
    };
    register(temp_dir.path(), &[("broken", broken)], &behaviors).await;
    let (app, factory) = bootstrap(temp_dir.path(), behaviors).await;
    let app = Arc::new(app);

    let cancel = CancellationToken::new();
    let runner = {
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(cancel).await })
    };

    let manager = app.plugin_manager().clone();
    assert!(
        eventually(WAIT, || {
            let manager = manager.clone();
            async move { manager.status("broken").await == Some(PluginStatus::Errored) }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!runner.is_finished());
    assert_eq!(factory.node("bridge").unwrap().start_count(), 0);

    cancel.cancel();
    assert_eq!(runner.await.unwrap().unwrap(), ExitReason::Shutdown);
}

#[tokio::test]
async fn test_core_install_over_the_bus_restarts() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), Some("childbridge"));
    let behaviors = Arc::new(Behaviors::default());
    let (app, _) = bootstrap(temp_dir.path(), behaviors).await;
    let app = Arc::new(app);

    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run(CancellationToken::new()).await })
    };
    let bus = app.bus().clone();
    let reply = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(reply) = bus
                .ask(
                    "tester",
                    constants::PLUGINS_CHANNEL,
                    "plugins_install",
                    serde_json::json!({ "name": constants::CORE_PACKAGE_NAME }),
                )
                .await
            {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reply["plugin"], serde_json::Value::Null);

    let reason = tokio::time::timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, ExitReason::Restart);
}

#[tokio::test]
async fn test_reset_targets_bridge_or_plugin_identity() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let behaviors = Arc::new(Behaviors::default());
    register(temp_dir.path(), &[("lights", Behavior::default())], &behaviors).await;
    let (app, _) = bootstrap(temp_dir.path(), behaviors).await;

    let storage = temp_dir.path().join("storage");
    std::fs::write(storage.join("endpoint.bridge.json"), "{}").unwrap();
    std::fs::write(storage.join("endpoint.plugin.lights.json"), "{}").unwrap();

    assert_eq!(app.reset(None).await.unwrap(), "bridge");
    assert!(!storage.join("endpoint.bridge.json").exists());

    assert_eq!(app.reset(Some("lights")).await.unwrap(), "plugin.lights");
    assert!(!storage.join("endpoint.plugin.lights.json").exists());

    let missing = app.reset(Some("ghost")).await;
    assert!(matches!(
        missing,
        Err(Error::PluginSystem(PluginSystemError::NotFound { .. }))
    ));

    let nowhere = temp_dir.path().join("nowhere");
    let missing = app.reset(Some(nowhere.to_str().unwrap())).await;
    assert!(matches!(
        missing,
        Err(Error::PluginSystem(PluginSystemError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_factory_reset_keeps_installed_packages() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let behaviors = Arc::new(Behaviors::default());
    register(temp_dir.path(), &[("lights", Behavior::default())], &behaviors).await;
    write_fast_app_config(temp_dir.path(), None);
    std::fs::write(temp_dir.path().join("lights.config.json"), "{}").unwrap();

    let (app, _) = bootstrap(temp_dir.path(), behaviors.clone()).await;
    app.factory_reset().await.unwrap();

    assert!(!temp_dir.path().join("storage/mbridge.json").exists());
    assert!(!temp_dir.path().join("lights.config.json").exists());
    assert!(!temp_dir.path().join("config/mbridge.json").exists());
    assert!(temp_dir.path().join("plugins/lights/plugin.json").exists());

    let (fresh, _) = bootstrap(temp_dir.path(), behaviors).await;
    fresh.initialize().await.unwrap();
    assert!(fresh.plugin_manager().is_empty().await);
}
