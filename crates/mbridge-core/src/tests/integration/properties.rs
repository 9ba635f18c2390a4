use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::{Running, WAIT};
use crate::kernel::bootstrap::ExitReason;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manager::ShutdownOptions;
use crate::plugin_system::registry::{PluginSnapshot, PluginStatus};
use crate::plugin_system::traits::LifecycleReason;
use crate::tests::fixtures::{Behavior, Behaviors, Outcome, device, eventually, write_fast_app_config};

fn monotonic(snapshot: &PluginSnapshot) -> bool {
    (!snapshot.configured || snapshot.started) && (!snapshot.started || snapshot.loaded)
}

#[tokio::test]
async fn test_lifecycle_flags_never_skip_a_stage() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), Some("childbridge"));
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running
        .install(
            "slow",
            Behavior {
                start: Outcome::Delay(Duration::from_millis(30)),
                devices: vec![device("s1")],
                ..Behavior::default()
            },
        )
        .await;
    running.install("fast", Behavior::dynamic(vec![device("f1")])).await;
    running
        .install(
            "broken",
            Behavior {
                start: Outcome::fail("nope"),
                ..Behavior::default()
            },
        )
        .await;

    let cancel = CancellationToken::new();
    let runner = running.spawn(&cancel);
    let manager = running.app.plugin_manager().clone();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let plugins = manager.list().await;
        for snapshot in &plugins {
            assert!(monotonic(snapshot), "flags out of order: {:?}", snapshot);
        }
        let settled = plugins
            .iter()
            .filter(|p| p.name != "broken")
            .all(|p| p.status == PluginStatus::Configured);
        if settled || tokio::time::Instant::now() >= deadline {
            assert!(settled, "plugins never reached configured");
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    cancel.cancel();
    runner.await.unwrap().unwrap();
    for snapshot in manager.list().await {
        assert!(monotonic(&snapshot));
    }
}

#[tokio::test]
async fn test_second_shutdown_changes_nothing() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running.install("p", Behavior::dynamic(vec![device("p1")])).await;
    let manager = running.app.plugin_manager();
    manager.load("p").await.unwrap();
    manager.start("p", LifecycleReason::Request).await.unwrap();

    let once = manager.shutdown("p", ShutdownOptions::default()).await.unwrap();
    let twice = manager.shutdown("p", ShutdownOptions::default()).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.status, PluginStatus::Unregistered);
    assert_eq!(running.behaviors.count("p:shutdown:request"), 1);
}

#[tokio::test]
async fn test_bridge_never_starts_an_endpoint_after_a_plugin_error() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), None);
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running.install("good", Behavior::dynamic(vec![device("g1")])).await;
    running
        .install(
            "late-failure",
            Behavior {
                start: Outcome::fail("gave up"),
                ..Behavior::default()
            },
        )
        .await;

    let cancel = CancellationToken::new();
    let runner = running.spawn(&cancel);
    let manager = running.app.plugin_manager().clone();
    assert!(
        eventually(WAIT, || {
            let manager = manager.clone();
            async move { manager.status("late-failure").await == Some(PluginStatus::Errored) }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let node = running.factory.node("bridge").unwrap();
    assert_eq!(node.start_count(), 0);
    for id in running.app.endpoints().ids().await {
        assert!(!running.app.endpoints().is_started(&id).await);
    }

    cancel.cancel();
    assert_eq!(runner.await.unwrap().unwrap(), ExitReason::Shutdown);
    assert_eq!(node.start_count(), 0);
}

#[tokio::test]
async fn test_persisted_registry_round_trips_identities_and_enabled_flags() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let behaviors = Arc::new(Behaviors::default());
    let before = {
        let running = Running::boot(temp_dir.path(), behaviors.clone()).await;
        for name in ["alpha", "beta", "gamma"] {
            running.install(name, Behavior::default()).await;
        }
        let manager = running.app.plugin_manager();
        manager.disable("beta").await.unwrap();
        manager.load("alpha").await.unwrap();
        manager.save_to_storage().await.unwrap();
        let before: Vec<(String, bool)> = manager.list().await.into_iter().map(|p| (p.name, p.enabled)).collect();
        running.app.close().await.unwrap();
        before
    };

    let fresh = Running::boot(temp_dir.path(), behaviors).await;
    let after: Vec<(String, bool)> = fresh
        .app
        .plugin_manager()
        .list()
        .await
        .into_iter()
        .map(|p| (p.name, p.enabled))
        .collect();
    assert_eq!(after, before);
    assert_eq!(fresh.app.plugin_manager().status("alpha").await, Some(PluginStatus::Unregistered));
}

#[tokio::test]
async fn test_adding_twice_registers_once_without_writing() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running.install("p", Behavior::default()).await;

    let storage_file = temp_dir.path().join("storage/mbridge.json");
    std::fs::remove_file(&storage_file).unwrap();

    let second = running.app.plugin_manager().add("p").await;
    assert!(matches!(second, Err(PluginSystemError::AlreadyRegistered { .. })));
    assert_eq!(running.app.plugin_manager().len().await, 1);
    assert!(!storage_file.exists());
}
