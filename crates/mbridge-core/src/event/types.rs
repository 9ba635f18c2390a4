use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::kernel::constants;

/// Unit exchanged on the [`BroadcastBus`](crate::event::BroadcastBus).
///
/// Events carry no `id` and never produce a response. Requests carry an `id`
/// and receive at most one response with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Message {
    pub fn event(src: &str, dst: &str, message_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            src: src.to_string(),
            dst: dst.to_string(),
            params,
            response: None,
        }
    }

    pub fn request(id: impl Into<String>, src: &str, dst: &str, message_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::event(src, dst, message_type, params)
        }
    }

    /// Response to this message: same id and type, addressed back to the sender
    pub fn respond(&self, responder: &str, response: Value) -> Self {
        Self {
            id: self.id.clone(),
            message_type: self.message_type.clone(),
            src: responder.to_string(),
            dst: self.src.clone(),
            params: self.params.clone(),
            response: Some(response),
        }
    }

    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.response.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.response.is_some()
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Whether a subscriber on `channel` should observe this message
    pub fn addressed_to(&self, channel: &str) -> bool {
        channel != self.src && (self.dst == constants::BROADCAST || self.dst == channel)
    }
}

/// Lifecycle events published by the plugin manager with `{name}` params
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginEvent {
    Added,
    Removed,
    Enabled,
    Disabled,
    Loaded,
    Started,
    Configured,
    Shutdown,
}

impl PluginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PluginEvent::Added => "added",
            PluginEvent::Removed => "removed",
            PluginEvent::Enabled => "enabled",
            PluginEvent::Disabled => "disabled",
            PluginEvent::Loaded => "loaded",
            PluginEvent::Started => "started",
            PluginEvent::Configured => "configured",
            PluginEvent::Shutdown => "shutdown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "added" => PluginEvent::Added,
            "removed" => PluginEvent::Removed,
            "enabled" => PluginEvent::Enabled,
            "disabled" => PluginEvent::Disabled,
            "loaded" => PluginEvent::Loaded,
            "started" => PluginEvent::Started,
            "configured" => PluginEvent::Configured,
            "shutdown" => PluginEvent::Shutdown,
            _ => return None,
        })
    }

    pub fn message(&self, plugin: &str) -> Message {
        Message::event(
            constants::PLUGINS_CHANNEL,
            constants::BROADCAST,
            self.name(),
            json!({ "name": plugin }),
        )
    }
}

impl fmt::Display for PluginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events published by the orchestrator and the endpoint lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    /// Endpoints announced reachable
    Reachable,
    EndpointOnline,
    EndpointOffline,
    EndpointCommissioned,
    /// The core package was installed and the process must restart
    RestartRequired,
    /// Terminal event after an ordered shutdown
    Shutdown,
    /// Terminal event after an ordered shutdown that precedes a restart
    Restart,
    /// Bridge startup stopped because a plugin errored
    StartupAborted,
}

impl SystemEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SystemEvent::Reachable => "reachable",
            SystemEvent::EndpointOnline => "endpoint_online",
            SystemEvent::EndpointOffline => "endpoint_offline",
            SystemEvent::EndpointCommissioned => "endpoint_commissioned",
            SystemEvent::RestartRequired => "restart_required",
            SystemEvent::Shutdown => "shutdown",
            SystemEvent::Restart => "restart",
            SystemEvent::StartupAborted => "startup_aborted",
        }
    }

    pub fn message(&self, params: Value) -> Message {
        Message::event(constants::CORE_CHANNEL, constants::BROADCAST, self.name(), params)
    }
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
