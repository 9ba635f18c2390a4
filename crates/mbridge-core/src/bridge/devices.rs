use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::event::types::Message;
use crate::event::{BroadcastBus, BusHandler, SubscriberId};
use crate::kernel::constants;
use crate::plugin_system::traits::BridgedDevice;

/// A device as known to the core, with the endpoint it was placed on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    #[serde(flatten)]
    pub device: BridgedDevice,
    pub endpoint: String,
    /// False until the endpoint accepted the device
    pub added: bool,
}

/// Every device contributed by a plugin, keyed `<plugin>/<device id>`.
/// Answers `devices_*` requests on the devices channel.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, DeviceEntry>>,
    subscription: Mutex<Option<SubscriberId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn device_key(plugin: &str, device_id: &str) -> String {
    format!("{}/{}", plugin, device_id)
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: BridgedDevice, endpoint: &str) {
        let key = device_key(&device.plugin, &device.id);
        let entry = DeviceEntry {
            device,
            endpoint: endpoint.to_string(),
            added: false,
        };
        lock(&self.devices).insert(key, entry);
    }

    pub fn mark_added(&self, plugin: &str, device_id: &str) {
        if let Some(entry) = lock(&self.devices).get_mut(&device_key(plugin, device_id)) {
            entry.added = true;
        }
    }

    pub fn remove(&self, plugin: &str, device_id: &str) -> Option<DeviceEntry> {
        lock(&self.devices).remove(&device_key(plugin, device_id))
    }

    /// Drop every device of a plugin and return them
    pub fn remove_plugin(&self, plugin: &str) -> Vec<DeviceEntry> {
        let mut devices = lock(&self.devices);
        let keys: Vec<String> = devices
            .iter()
            .filter(|(_, entry)| entry.device.plugin == plugin)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| devices.remove(key)).collect()
    }

    pub fn has(&self, plugin: &str, device_id: &str) -> bool {
        lock(&self.devices).contains_key(&device_key(plugin, device_id))
    }

    pub fn get(&self, plugin: &str, device_id: &str) -> Option<DeviceEntry> {
        lock(&self.devices).get(&device_key(plugin, device_id)).cloned()
    }

    pub fn of_plugin(&self, plugin: &str) -> Vec<DeviceEntry> {
        lock(&self.devices)
            .values()
            .filter(|entry| entry.device.plugin == plugin)
            .cloned()
            .collect()
    }

    /// `(registered, added)` device counts of a plugin
    pub fn counts(&self, plugin: &str) -> (usize, usize) {
        let devices = lock(&self.devices);
        let owned = devices.values().filter(|entry| entry.device.plugin == plugin);
        owned.fold((0, 0), |(registered, added), entry| {
            (registered + 1, added + usize::from(entry.added))
        })
    }

    pub fn list(&self) -> Vec<DeviceEntry> {
        lock(&self.devices).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.devices).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.devices).clear();
    }

    pub fn attach_bus(self: &Arc<Self>, bus: &BroadcastBus) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_none() {
            let handler = Arc::new(DevicesRequestHandler {
                registry: Arc::downgrade(self),
            });
            *subscription = Some(bus.subscribe(constants::DEVICES_CHANNEL, handler));
        }
    }

    pub fn detach_bus(&self, bus: &BroadcastBus) {
        if let Some(id) = lock(&self.subscription).take() {
            let _ = bus.unsubscribe(id);
        }
    }

    fn answer(&self, message: &Message) -> Option<Value> {
        let plugin = message.param_str("plugin").unwrap_or_default();
        let id = message.param_str("id").unwrap_or_default();
        match message.message_type.as_str() {
            "devices_length" => Some(json!({ "length": self.len() })),
            "devices_has" => Some(json!({ "has": self.has(plugin, id) })),
            "devices_get" => Some(json!({ "device": self.get(plugin, id) })),
            "devices_list" => {
                let devices = if plugin.is_empty() { self.list() } else { self.of_plugin(plugin) };
                Some(json!({ "devices": devices }))
            }
            _ => None,
        }
    }
}

struct DevicesRequestHandler {
    registry: Weak<DeviceRegistry>,
}

#[async_trait]
impl BusHandler for DevicesRequestHandler {
    async fn handle(&self, message: &Message) -> Option<Value> {
        if !message.is_request() {
            return None;
        }
        self.registry.upgrade()?.answer(message)
    }
}
