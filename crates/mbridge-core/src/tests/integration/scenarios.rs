use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::{Running, WAIT};
use crate::event::types::Message;
use crate::kernel::bootstrap::ExitReason;
use crate::kernel::constants;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::registry::PluginStatus;
use crate::tests::fixtures::{Behavior, Behaviors, Outcome, device, read_json, write_fast_app_config, write_plugin};

#[tokio::test]
async fn test_add_to_empty_registry_persists_one_entry() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let running = Running::boot(temp_dir.path(), Arc::default()).await;

    running.install("sample-plugin", Behavior::default()).await;

    let plugins = running.app.plugin_manager().list().await;
    assert_eq!(plugins.len(), 1);
    assert!(plugins[0].enabled);
    assert!(!plugins[0].loaded);
    assert_eq!(plugins[0].status, PluginStatus::Unregistered);

    let stored = read_json(&temp_dir.path().join("storage/mbridge.json"));
    let entries = stored["plugins"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], json!("sample-plugin"));
    assert_eq!(entries[0]["enabled"], json!(true));
}

#[tokio::test]
async fn test_load_without_entry_point_yields_no_platform() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running.install("sample-plugin", Behavior::default()).await;
    write_plugin(&temp_dir.path().join(constants::PLUGINS_DIR), "sample-plugin", None);

    let result = running.app.plugin_manager().load("sample-plugin").await;
    assert!(matches!(result, Err(PluginSystemError::MissingEntryPoint { .. })));

    let snapshot = running.app.plugin_manager().get("sample-plugin").await.unwrap();
    assert!(snapshot.error);
    assert!(!snapshot.loaded);
    assert_eq!(running.behaviors.count("sample-plugin:instantiate"), 0);
}

#[tokio::test]
async fn test_childbridge_keeps_healthy_plugin_when_another_errors() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    write_fast_app_config(temp_dir.path(), Some("childbridge"));
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running
        .install(
            "a",
            Behavior {
                start: Outcome::fail("lost connection"),
                ..Behavior::default()
            },
        )
        .await;
    running.install("b", Behavior::dynamic(vec![device("b1")])).await;

    let cancel = CancellationToken::new();
    let runner = running.spawn(&cancel);

    assert!(running.endpoint_ready("plugin.b").await);
    assert_eq!(running.app.plugin_manager().status("a").await, Some(PluginStatus::Errored));
    assert!(!running.factory.created().contains(&"plugin.a".to_string()));
    assert!(!running.app.endpoints().exists("plugin.a").await);

    cancel.cancel();
    assert_eq!(runner.await.unwrap().unwrap(), ExitReason::Shutdown);
}

#[tokio::test]
async fn test_enable_survives_a_fresh_load() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let behaviors = Arc::new(Behaviors::default());
    {
        let running = Running::boot(temp_dir.path(), behaviors.clone()).await;
        running.install("p", Behavior::default()).await;
        let manager = running.app.plugin_manager();
        manager.disable("p").await.unwrap();
        assert!(!manager.get("p").await.unwrap().enabled);
        manager.enable("p").await.unwrap();
        manager.save_to_storage().await.unwrap();
        running.app.close().await.unwrap();
    }

    let fresh = Running::boot(temp_dir.path(), behaviors).await;
    assert!(fresh.app.plugin_manager().get("p").await.unwrap().enabled);
}

#[tokio::test]
async fn test_plugins_get_request_has_exactly_one_response() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let running = Running::boot(temp_dir.path(), Arc::default()).await;
    running.install("p", Behavior::default()).await;
    let bus = running.app.bus().clone();
    let mut tap = bus.watch();

    let reply = tokio::time::timeout(
        WAIT,
        bus.request(Message::request("42", "tester", constants::PLUGINS_CHANNEL, "plugins_get", json!({ "name": "p" }))),
    )
    .await
    .unwrap()
    .unwrap();

    let current = serde_json::to_value(running.app.plugin_manager().get("p").await.unwrap()).unwrap();
    assert_eq!(reply.id.as_deref(), Some("42"));
    assert_eq!(reply.response.as_ref().unwrap()["plugin"], current);

    let mut responses = 0;
    while let Ok(message) = tap.try_recv() {
        if message.is_response() && message.id.as_deref() == Some("42") {
            responses += 1;
        }
    }
    assert_eq!(responses, 1);
}
