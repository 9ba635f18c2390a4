use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::endpoint::error::EndpointError;
use crate::endpoint::record::{
    CommissioningState, EndpointDefaults, EndpointOwner, EndpointRecord, EndpointSnapshot, bridge_endpoint_id,
    storage_namespace,
};
use crate::endpoint::server::{ServerEvent, ServerNode, ServerNodeFactory, ServerNodeSpec};
use crate::event::BroadcastBus;
use crate::event::types::SystemEvent;
use crate::kernel::constants;
use crate::plugin_system::manager::PluginManager;
use crate::plugin_system::traits::BridgedDevice;
use crate::storage::context::PersistenceStore;

type EndpointResult<T> = std::result::Result<T, EndpointError>;

struct Endpoint {
    record: EndpointRecord,
    node: Arc<dyn ServerNode>,
    pump: Option<JoinHandle<()>>,
}

/// Creates, starts and stops server endpoints and keeps their identity
/// storage and commissioning view current.
pub struct EndpointLifecycle {
    name: &'static str,
    store: Arc<dyn PersistenceStore>,
    factory: Arc<dyn ServerNodeFactory>,
    bus: Arc<BroadcastBus>,
    manager: Arc<PluginManager>,
    defaults: EndpointDefaults,
    endpoints: Mutex<BTreeMap<String, Endpoint>>,
    next_port: Mutex<u16>,
    self_ref: Weak<EndpointLifecycle>,
}

impl fmt::Debug for EndpointLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLifecycle")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl EndpointLifecycle {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        factory: Arc<dyn ServerNodeFactory>,
        bus: Arc<BroadcastBus>,
        manager: Arc<PluginManager>,
        defaults: EndpointDefaults,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: "EndpointLifecycle",
            store,
            factory,
            bus,
            manager,
            defaults,
            endpoints: Mutex::new(BTreeMap::new()),
            next_port: Mutex::new(defaults.port),
            self_ref: self_ref.clone(),
        })
    }

    pub fn defaults(&self) -> &EndpointDefaults {
        &self.defaults
    }

    /// Next port not used by an open endpoint
    async fn allocate_port(&self, endpoints: &BTreeMap<String, Endpoint>) -> u16 {
        let mut next = self.next_port.lock().await;
        loop {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if !endpoints.values().any(|e| e.record.identity.port == candidate) {
                return candidate;
            }
        }
    }

    /// Open an endpoint and build its server node. Returns the existing
    /// endpoint when one with this id is already open.
    pub async fn create(&self, id: &str, owner: EndpointOwner, aggregator: bool) -> EndpointResult<EndpointSnapshot> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(existing) = endpoints.get(id) {
            return Ok(existing.record.snapshot());
        }

        let storage = self.store.context(&storage_namespace(id)).await?;
        let port = self.allocate_port(&endpoints).await;
        let is_bridge = owner == EndpointOwner::Bridge;
        let defaults = if is_bridge {
            self.defaults
        } else {
            EndpointDefaults {
                port,
                passcode: None,
                discriminator: None,
            }
        };
        let mut record = EndpointRecord::open(id, owner, aggregator, storage, port, &defaults).await?;

        // Explicitly configured values win over a persisted bridge identity
        if is_bridge {
            let mut changed = false;
            if let Some(passcode) = self.defaults.passcode.filter(|p| *p != record.identity.passcode) {
                crate::endpoint::record::validate_passcode(passcode)?;
                record.identity.passcode = passcode;
                changed = true;
            }
            if let Some(discriminator) = self.defaults.discriminator.filter(|d| *d != record.identity.discriminator) {
                record.identity.discriminator = discriminator;
                changed = true;
            }
            if changed {
                record.persist_identity().await?;
                record.refresh_commissioning();
            }
        }

        let spec = ServerNodeSpec {
            id: id.to_string(),
            name: match &record.owner {
                EndpointOwner::Bridge => constants::APP_NAME.to_string(),
                EndpointOwner::Plugin { plugin } => plugin.clone(),
                EndpointOwner::Device { device, .. } => device.clone(),
            },
            port: record.identity.port,
            passcode: record.identity.passcode,
            discriminator: record.identity.discriminator,
            vendor_id: constants::VENDOR_ID,
            product_id: constants::PRODUCT_ID,
            aggregator,
        };
        let node = self.factory.create(&spec)?;
        let pump = self.spawn_pump(id, node.subscribe());

        log::info!(
            "Created endpoint '{}' on port {} (aggregator: {})",
            id,
            record.identity.port,
            aggregator
        );
        let snapshot = record.snapshot();
        endpoints.insert(id.to_string(), Endpoint { record, node, pump: Some(pump) });
        Ok(snapshot)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.endpoints.lock().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.endpoints.lock().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self, id: &str) -> Option<EndpointSnapshot> {
        self.endpoints.lock().await.get(id).map(|e| e.record.snapshot())
    }

    pub async fn is_started(&self, id: &str) -> bool {
        self.endpoints.lock().await.get(id).is_some_and(|e| e.record.started)
    }

    pub async fn commissioning(&self, id: &str) -> Option<CommissioningState> {
        self.endpoints.lock().await.get(id).map(|e| e.record.commissioning.clone())
    }

    pub async fn start(&self, id: &str) -> EndpointResult<()> {
        let node = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            if endpoint.record.started {
                return Ok(());
            }
            endpoint.node.clone()
        };
        node.start().await?;

        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get_mut(id) {
            endpoint.record.started = true;
            if !endpoint.record.identity.commissioned {
                log::info!(
                    "Endpoint '{}' is waiting for commissioning. Manual pairing code: {} QR: {}",
                    id,
                    endpoint.record.manual_pairing_code(),
                    endpoint.record.qr_pairing_code()
                );
            }
        }
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> EndpointResult<()> {
        let node = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            if !endpoint.record.started {
                return Ok(());
            }
            endpoint.node.clone()
        };
        node.stop().await?;

        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get_mut(id) {
            endpoint.record.started = false;
            endpoint.record.reachable = false;
            endpoint.record.online = false;
            endpoint.record.clear_commissioning();
        }
        log::info!("Stopped endpoint '{}'", id);
        Ok(())
    }

    /// Stop every endpoint, the shared bridge first
    pub async fn stop_all(&self) {
        let mut ids = self.ids().await;
        let bridge = bridge_endpoint_id();
        if let Some(position) = ids.iter().position(|id| *id == bridge) {
            let id = ids.remove(position);
            ids.insert(0, id);
        }
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                log::warn!("Stopping endpoint '{}' failed: {}", id, e);
            }
        }
    }

    pub async fn set_reachable(&self, id: &str, reachable: bool) -> EndpointResult<()> {
        let node = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            endpoint.node.clone()
        };
        node.set_reachable(reachable).await?;
        if let Some(endpoint) = self.endpoints.lock().await.get_mut(id) {
            endpoint.record.reachable = reachable;
        }
        Ok(())
    }

    /// Mark the given started endpoints reachable and notify subscribers.
    /// Returns the endpoints that were marked.
    pub async fn announce_reachable(&self, ids: &[String]) -> Vec<String> {
        let mut marked = Vec::new();
        for id in ids {
            if !self.is_started(id).await {
                continue;
            }
            match self.set_reachable(id, true).await {
                Ok(()) => marked.push(id.clone()),
                Err(e) => log::warn!("Endpoint '{}' could not be marked reachable: {}", id, e),
            }
        }
        if !marked.is_empty() {
            log::info!("Endpoint(s) reachable: {}", marked.join(", "));
            self.bus
                .publish(SystemEvent::Reachable.message(json!({ "endpoints": marked })))
                .await;
        }
        marked
    }

    /// Mark every started endpoint reachable
    pub async fn set_reachable_all(&self) -> Vec<String> {
        let ids = self.ids().await;
        self.announce_reachable(&ids).await
    }

    /// Add a device to an endpoint. Returns the endpoint's device count.
    pub async fn add_device(&self, id: &str, device: BridgedDevice) -> EndpointResult<usize> {
        let node = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            endpoint.node.clone()
        };
        node.add_device(&device).await?;
        let mut endpoints = self.endpoints.lock().await;
        let endpoint = endpoints
            .get_mut(id)
            .ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
        endpoint.record.devices.insert(device_key(&device.plugin, &device.id), device);
        Ok(endpoint.record.devices.len())
    }

    pub async fn remove_device(&self, id: &str, plugin: &str, device_id: &str) -> EndpointResult<bool> {
        let node = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            endpoint.node.clone()
        };
        node.remove_device(device_id).await?;
        let mut endpoints = self.endpoints.lock().await;
        Ok(endpoints
            .get_mut(id)
            .is_some_and(|e| e.record.devices.remove(&device_key(plugin, device_id)).is_some()))
    }

    /// Remove every device a plugin contributed to an endpoint
    pub async fn remove_devices_of(&self, id: &str, plugin: &str) -> EndpointResult<usize> {
        let device_ids: Vec<String> = {
            let endpoints = self.endpoints.lock().await;
            let endpoint = endpoints.get(id).ok_or_else(|| EndpointError::NotFound { id: id.to_string() })?;
            endpoint
                .record
                .devices
                .values()
                .filter(|device| device.plugin == plugin)
                .map(|device| device.id.clone())
                .collect()
        };
        let mut removed = 0;
        for device_id in device_ids {
            if self.remove_device(id, plugin, &device_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stop an endpoint, close its identity storage and forget it
    pub async fn teardown(&self, id: &str) -> EndpointResult<()> {
        if !self.exists(id).await {
            return Ok(());
        }
        self.stop(id).await?;
        let endpoint = self.endpoints.lock().await.remove(id);
        if let Some(endpoint) = endpoint {
            if let Some(pump) = endpoint.pump {
                pump.abort();
            }
            self.store.close_context(endpoint.record.storage.namespace()).await?;
            log::info!("Tore down endpoint '{}'", id);
        }
        Ok(())
    }

    /// Close the identity storage of every endpoint
    pub async fn close_storage_all(&self) {
        let namespaces: Vec<String> = self
            .endpoints
            .lock()
            .await
            .values()
            .map(|e| e.record.storage.namespace().to_string())
            .collect();
        for namespace in namespaces {
            if let Err(e) = self.store.close_context(&namespace).await {
                log::warn!("Closing endpoint storage '{}' failed: {}", namespace, e);
            }
        }
    }

    /// Forget every endpoint; they must already be stopped
    pub async fn clear(&self) {
        let mut endpoints = self.endpoints.lock().await;
        for endpoint in endpoints.values_mut() {
            if let Some(pump) = endpoint.pump.take() {
                pump.abort();
            }
        }
        endpoints.clear();
        *self.next_port.lock().await = self.defaults.port;
    }

    /// Delete the persisted identity of an endpoint that is not running
    pub async fn reset_identity(&self, id: &str) -> EndpointResult<()> {
        if self.is_started(id).await {
            return Err(EndpointError::server(id, "reset", "endpoint is running"));
        }
        self.store.remove_context(&storage_namespace(id)).await?;
        log::info!("Reset network identity of endpoint '{}'", id);
        Ok(())
    }

    fn spawn_pump(&self, id: &str, mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
        let lifecycle = self.self_ref.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Endpoint '{}' skipped {} server event(s)", id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(lifecycle) = lifecycle.upgrade() else {
                    break;
                };
                if let Err(e) = lifecycle.apply_event(&id, event).await {
                    log::warn!("Endpoint '{}' event handling failed: {}", id, e);
                }
            }
        })
    }

    async fn apply_event(&self, id: &str, event: ServerEvent) -> EndpointResult<()> {
        let (system_event, state, owner) = {
            let mut endpoints = self.endpoints.lock().await;
            let Some(endpoint) = endpoints.get_mut(id) else {
                return Ok(());
            };
            let record = &mut endpoint.record;
            let system_event = match event {
                ServerEvent::Online => {
                    record.online = true;
                    record.refresh_commissioning();
                    Some(SystemEvent::EndpointOnline)
                }
                ServerEvent::Offline => {
                    record.online = false;
                    record.reachable = false;
                    record.clear_commissioning();
                    Some(SystemEvent::EndpointOffline)
                }
                ServerEvent::Commissioned { fabrics } => {
                    record.identity.commissioned = true;
                    record.identity.fabrics = fabrics;
                    record.persist_identity().await?;
                    record.refresh_commissioning();
                    Some(SystemEvent::EndpointCommissioned)
                }
                ServerEvent::Decommissioned => {
                    record.identity.commissioned = false;
                    record.identity.fabrics.clear();
                    record.persist_identity().await?;
                    record.refresh_commissioning();
                    None
                }
                ServerEvent::FabricsChanged { fabrics } => {
                    record.identity.commissioned = !fabrics.is_empty();
                    record.identity.fabrics = fabrics;
                    record.persist_identity().await?;
                    record.refresh_commissioning();
                    None
                }
                ServerEvent::SessionsChanged { sessions } => {
                    record.commissioning.sessions = sessions;
                    None
                }
            };
            (system_event, record.commissioning.clone(), record.owner.clone())
        };

        let plugins = match owner.plugin() {
            Some(plugin) => vec![plugin.to_string()],
            None => self
                .manager
                .list()
                .await
                .into_iter()
                .filter(|plugin| plugin.endpoint.as_deref() == Some(id))
                .map(|plugin| plugin.name)
                .collect(),
        };
        for plugin in &plugins {
            self.manager.update_commissioning(plugin, state.clone()).await;
        }

        if let Some(system_event) = system_event {
            log::debug!("Endpoint '{}': {}", id, system_event);
            self.bus
                .publish(system_event.message(json!({ "id": id, "plugins": plugins })))
                .await;
        }
        Ok(())
    }
}

fn device_key(plugin: &str, device_id: &str) -> String {
    format!("{}/{}", plugin, device_id)
}
