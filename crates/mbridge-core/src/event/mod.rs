//! # mbridge Event System
//!
//! The [`BroadcastBus`] decouples the plugin manager, the device registry,
//! the endpoint lifecycle and the presentation layer. Subscribers register a
//! [`BusHandler`] on a channel name; events fan out to every addressed
//! subscriber while requests are answered by the first handler that returns
//! a response.
//!
//! Handlers must treat message types they do not know as silent no-ops and
//! return `None`.
pub mod dispatcher;
pub mod error;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

/// Identifier handed out by [`BroadcastBus::subscribe`]
pub type SubscriberId = u64;

/// Receives bus messages addressed to the channel it subscribed on
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Return `Some(response)` to answer a request. Events ignore the return value.
    async fn handle(&self, message: &Message) -> Option<Value>;
}

pub use dispatcher::BroadcastBus;
pub use error::EventSystemError;
pub use types::{Message, PluginEvent, SystemEvent};

#[cfg(test)]
mod tests;
