use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::endpoint::error::EndpointError;
use crate::endpoint::record::{FabricInfo, SessionInfo};
use crate::plugin_system::traits::BridgedDevice;

const EVENT_CAPACITY: usize = 64;

/// Commissioning-side notifications from a server node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Online,
    Offline,
    Commissioned { fabrics: Vec<FabricInfo> },
    /// The last fabric was removed
    Decommissioned,
    FabricsChanged { fabrics: Vec<FabricInfo> },
    SessionsChanged { sessions: Vec<SessionInfo> },
}

/// Parameters a server node is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNodeSpec {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub passcode: u32,
    pub discriminator: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Whether devices are grouped behind an aggregation point
    pub aggregator: bool,
}

/// Network-addressable server identity provided by the protocol stack
#[async_trait]
pub trait ServerNode: Send + Sync + fmt::Debug {
    async fn start(&self) -> Result<(), EndpointError>;

    async fn stop(&self) -> Result<(), EndpointError>;

    async fn set_reachable(&self, reachable: bool) -> Result<(), EndpointError>;

    async fn add_device(&self, device: &BridgedDevice) -> Result<(), EndpointError>;

    async fn remove_device(&self, device_id: &str) -> Result<(), EndpointError>;

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

pub trait ServerNodeFactory: Send + Sync + fmt::Debug {
    fn create(&self, spec: &ServerNodeSpec) -> Result<Arc<dyn ServerNode>, EndpointError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct LocalNodeState {
    running: bool,
    reachable: bool,
    starts: usize,
    devices: BTreeMap<String, BridgedDevice>,
    fabrics: Vec<FabricInfo>,
    sessions: Vec<SessionInfo>,
}

/// In-process server node. Keeps state in memory and lets callers drive
/// commissioning events by hand.
#[derive(Debug)]
pub struct LocalServerNode {
    spec: ServerNodeSpec,
    state: Mutex<LocalNodeState>,
    events: broadcast::Sender<ServerEvent>,
}

impl LocalServerNode {
    pub fn new(spec: ServerNodeSpec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            spec,
            state: Mutex::new(LocalNodeState::default()),
            events,
        }
    }

    pub fn spec(&self) -> &ServerNodeSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn is_reachable(&self) -> bool {
        lock(&self.state).reachable
    }

    /// How many times the node was started
    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn device_ids(&self) -> Vec<String> {
        lock(&self.state).devices.keys().cloned().collect()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Simulate a controller joining a fabric
    pub fn commission(&self, fabric: FabricInfo) {
        let fabrics = {
            let mut state = lock(&self.state);
            state.fabrics.retain(|f| f.fabric_index != fabric.fabric_index);
            state.fabrics.push(fabric);
            state.fabrics.clone()
        };
        if fabrics.len() == 1 {
            self.emit(ServerEvent::Commissioned { fabrics });
        } else {
            self.emit(ServerEvent::FabricsChanged { fabrics });
        }
    }

    pub fn remove_fabric(&self, fabric_index: u8) {
        let fabrics = {
            let mut state = lock(&self.state);
            state.fabrics.retain(|f| f.fabric_index != fabric_index);
            state.fabrics.clone()
        };
        if fabrics.is_empty() {
            self.emit(ServerEvent::Decommissioned);
        } else {
            self.emit(ServerEvent::FabricsChanged { fabrics });
        }
    }

    pub fn open_session(&self, session: SessionInfo) {
        let sessions = {
            let mut state = lock(&self.state);
            state.sessions.retain(|s| s.id != session.id);
            state.sessions.push(session);
            state.sessions.clone()
        };
        self.emit(ServerEvent::SessionsChanged { sessions });
    }
}

#[async_trait]
impl ServerNode for LocalServerNode {
    async fn start(&self) -> Result<(), EndpointError> {
        {
            let mut state = lock(&self.state);
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.starts += 1;
        }
        log::debug!("Server node '{}' listening on port {}", self.spec.id, self.spec.port);
        self.emit(ServerEvent::Online);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EndpointError> {
        {
            let mut state = lock(&self.state);
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.reachable = false;
            state.sessions.clear();
        }
        self.emit(ServerEvent::Offline);
        Ok(())
    }

    async fn set_reachable(&self, reachable: bool) -> Result<(), EndpointError> {
        let mut state = lock(&self.state);
        if !state.running && reachable {
            return Err(EndpointError::server(&self.spec.id, "set reachable", "node is not running"));
        }
        state.reachable = reachable;
        Ok(())
    }

    async fn add_device(&self, device: &BridgedDevice) -> Result<(), EndpointError> {
        let mut state = lock(&self.state);
        if !self.spec.aggregator && !state.devices.is_empty() && !state.devices.contains_key(&device.id) {
            return Err(EndpointError::server(
                &self.spec.id,
                "add device",
                "node without aggregator holds a single device",
            ));
        }
        state.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), EndpointError> {
        lock(&self.state).devices.remove(device_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// Builds [`LocalServerNode`]s and keeps them reachable by endpoint id
#[derive(Debug, Default)]
pub struct LocalServerFactory {
    nodes: Mutex<BTreeMap<String, Arc<LocalServerNode>>>,
    created: Mutex<Vec<String>>,
}

impl LocalServerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<Arc<LocalServerNode>> {
        lock(&self.nodes).get(id).cloned()
    }

    /// Endpoint ids in creation order, including recreated ones
    pub fn created(&self) -> Vec<String> {
        lock(&self.created).clone()
    }
}

impl ServerNodeFactory for LocalServerFactory {
    fn create(&self, spec: &ServerNodeSpec) -> Result<Arc<dyn ServerNode>, EndpointError> {
        let node = Arc::new(LocalServerNode::new(spec.clone()));
        lock(&self.nodes).insert(spec.id.clone(), node.clone());
        lock(&self.created).push(spec.id.clone());
        Ok(node)
    }
}
