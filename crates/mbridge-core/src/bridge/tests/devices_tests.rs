use std::sync::Arc;

use serde_json::json;

use crate::bridge::devices::{DeviceRegistry, device_key};
use crate::event::BroadcastBus;
use crate::kernel::constants;
use crate::plugin_system::traits::BridgedDevice;

fn owned(plugin: &str, id: &str) -> BridgedDevice {
    let mut device = BridgedDevice::new(id, format!("Device {}", id), "light");
    device.plugin = plugin.to_string();
    device
}

#[test]
fn test_counts_track_registration_and_acceptance() {
    let registry = DeviceRegistry::new();
    registry.insert(owned("a", "1"), "bridge");
    registry.insert(owned("a", "2"), "bridge");
    registry.insert(owned("b", "1"), "bridge");
    registry.mark_added("a", "1");

    assert_eq!(registry.counts("a"), (2, 1));
    assert_eq!(registry.counts("b"), (1, 0));
    assert_eq!(registry.counts("c"), (0, 0));
    assert_eq!(registry.len(), 3);
    assert_eq!(device_key("a", "1"), "a/1");
}

#[test]
fn test_same_device_id_is_scoped_by_plugin() {
    let registry = DeviceRegistry::new();
    registry.insert(owned("a", "lamp"), "plugin.a");
    registry.insert(owned("b", "lamp"), "plugin.b");

    assert_eq!(registry.get("a", "lamp").unwrap().endpoint, "plugin.a");
    assert_eq!(registry.get("b", "lamp").unwrap().endpoint, "plugin.b");
    assert!(registry.remove("a", "lamp").is_some());
    assert!(registry.has("b", "lamp"));
}

#[test]
fn test_remove_plugin_drops_only_its_devices() {
    let registry = DeviceRegistry::new();
    registry.insert(owned("a", "1"), "bridge");
    registry.insert(owned("a", "2"), "bridge");
    registry.insert(owned("b", "1"), "bridge");

    let removed = registry.remove_plugin("a");
    assert_eq!(removed.len(), 2);
    assert!(registry.of_plugin("a").is_empty());
    assert_eq!(registry.list().len(), 1);

    registry.clear();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_devices_requests_are_answered_on_the_bus() {
    let bus = BroadcastBus::new();
    let registry = Arc::new(DeviceRegistry::new());
    registry.insert(owned("a", "1"), "bridge");
    registry.insert(owned("b", "1"), "bridge");
    registry.mark_added("a", "1");
    registry.attach_bus(&bus);

    let ask = |message_type: &'static str, params: serde_json::Value| {
        bus.ask("tester", constants::DEVICES_CHANNEL, message_type, params)
    };
    assert_eq!(ask("devices_length", json!({})).await.unwrap(), json!({ "length": 2 }));
    assert_eq!(
        ask("devices_has", json!({ "plugin": "a", "id": "1" })).await.unwrap(),
        json!({ "has": true })
    );

    let device = ask("devices_get", json!({ "plugin": "a", "id": "1" })).await.unwrap();
    assert_eq!(device["device"]["endpoint"], json!("bridge"));
    assert_eq!(device["device"]["added"], json!(true));
    assert_eq!(device["device"]["plugin"], json!("a"));

    let listed = ask("devices_list", json!({ "plugin": "b" })).await.unwrap();
    assert_eq!(listed["devices"].as_array().unwrap().len(), 1);

    registry.detach_bus(&bus);
    assert!(ask("devices_length", json!({})).await.is_err());
}
