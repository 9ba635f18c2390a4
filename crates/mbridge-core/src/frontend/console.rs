use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::event::types::{Message, PluginEvent};
use crate::event::{BroadcastBus, BusHandler, SubscriberId};
use crate::frontend::Frontend;
use crate::kernel::constants;
use crate::kernel::error::Result;
use crate::plugin_system::registry::PluginSnapshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Logs plugin and endpoint changes and keeps the last known view of every plugin
#[derive(Debug)]
pub struct ConsoleFrontend {
    bus: Arc<BroadcastBus>,
    plugins: Mutex<BTreeMap<String, PluginSnapshot>>,
    subscription: Mutex<Option<SubscriberId>>,
    refreshes: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<ConsoleFrontend>,
}

impl ConsoleFrontend {
    pub fn new(bus: Arc<BroadcastBus>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            bus,
            plugins: Mutex::new(BTreeMap::new()),
            subscription: Mutex::new(None),
            refreshes: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Last view of a plugin received from the plugin manager
    pub fn latest(&self, plugin: &str) -> Option<PluginSnapshot> {
        lock(&self.plugins).get(plugin).cloned()
    }

    pub fn known_plugins(&self) -> Vec<String> {
        lock(&self.plugins).keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    async fn refresh(&self, plugin: &str) {
        let reply = self
            .bus
            .ask(
                constants::FRONTEND_CHANNEL,
                constants::PLUGINS_CHANNEL,
                "plugins_get",
                json!({ "name": plugin }),
            )
            .await;
        let snapshot = match reply {
            Ok(response) => response
                .get("plugin")
                .cloned()
                .and_then(|value| serde_json::from_value::<PluginSnapshot>(value).ok()),
            Err(e) => {
                log::debug!("Refreshing plugin '{}' failed: {}", plugin, e);
                return;
            }
        };
        let mut plugins = lock(&self.plugins);
        match snapshot {
            Some(snapshot) => {
                plugins.insert(plugin.to_string(), snapshot);
            }
            None => {
                plugins.remove(plugin);
            }
        }
    }

    fn on_plugin_event(&self, event: PluginEvent, plugin: &str) {
        log::info!("[{}] {}", plugin, event);
        if event == PluginEvent::Removed {
            lock(&self.plugins).remove(plugin);
            return;
        }
        let Some(frontend) = self.self_ref.upgrade() else {
            return;
        };
        let plugin = plugin.to_string();
        let task = tokio::spawn(async move { frontend.refresh(&plugin).await });
        let mut refreshes = lock(&self.refreshes);
        refreshes.retain(|handle| !handle.is_finished());
        refreshes.push(task);
    }

    fn on_system_event(&self, message: &Message) {
        match message.message_type.as_str() {
            "endpoint_online" | "endpoint_offline" | "endpoint_commissioned" => {
                let id = message.param_str("id").unwrap_or("?");
                log::info!("Endpoint '{}': {}", id, message.message_type);
            }
            "reachable" => log::info!("Bridge reachable: {}", message.params),
            "restart_required" => log::warn!("A restart is required to finish the update"),
            "startup_aborted" => log::error!("Startup aborted: {}", message.params),
            _ => {}
        }
    }
}

struct FrontendEventHandler {
    frontend: Weak<ConsoleFrontend>,
}

#[async_trait]
impl BusHandler for FrontendEventHandler {
    async fn handle(&self, message: &Message) -> Option<Value> {
        if message.is_request() {
            return None;
        }
        let frontend = self.frontend.upgrade()?;
        if message.src == constants::PLUGINS_CHANNEL {
            if let (Some(event), Some(plugin)) =
                (PluginEvent::from_name(&message.message_type), message.param_str("name"))
            {
                frontend.on_plugin_event(event, plugin);
                return None;
            }
        }
        frontend.on_system_event(message);
        None
    }
}

#[async_trait]
impl Frontend for ConsoleFrontend {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn start(&self) -> Result<()> {
        let mut subscription = lock(&self.subscription);
        if subscription.is_none() {
            let handler = Arc::new(FrontendEventHandler {
                frontend: self.self_ref.clone(),
            });
            *subscription = Some(self.bus.subscribe(constants::FRONTEND_CHANNEL, handler));
            log::debug!("Console frontend started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(id) = lock(&self.subscription).take() {
            self.bus.unsubscribe(id)?;
        }
        for task in lock(&self.refreshes).drain(..) {
            task.abort();
        }
        Ok(())
    }
}
