use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::error::EventSystemError;
use crate::event::types::Message;
use crate::event::{BusHandler, SubscriberId};
use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::Result;

const TAP_CAPACITY: usize = 256;

struct Subscriber {
    id: SubscriberId,
    channel: String,
    handler: Arc<dyn BusHandler>,
}

/// Typed publish / request-response channel shared by the core subsystems.
///
/// Subscribers register on a channel name. A message reaches every subscriber
/// whose channel equals `dst` (or all of them for `*`) except the channel
/// that sent it. Handlers are invoked outside the subscriber lock, in
/// registration order, so delivery is ordered per publisher.
pub struct BroadcastBus {
    subscribers: Mutex<Vec<Subscriber>>,
    pending: Mutex<HashSet<String>>,
    next_subscriber_id: AtomicU64,
    next_request_id: AtomicU64,
    tap: broadcast::Sender<Message>,
    request_timeout: Duration,
}

impl fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("subscribers", &lock(&self.subscribers).len())
            .field("pending", &lock(&self.pending).len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes an in-flight id however the request ends
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_timeout(constants::REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            subscribers: Mutex::new(Vec::new()),
            pending: Mutex::new(HashSet::new()),
            next_subscriber_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            tap,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn subscribe(&self, channel: &str, handler: Arc<dyn BusHandler>) -> SubscriberId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).push(Subscriber {
            id,
            channel: channel.to_string(),
            handler,
        });
        log::debug!("Bus subscriber {} registered on '{}'", id, channel);
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> std::result::Result<(), EventSystemError> {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return Err(EventSystemError::UnknownSubscriber { id });
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Stream of every message and response crossing the bus
    pub fn watch(&self) -> broadcast::Receiver<Message> {
        self.tap.subscribe()
    }

    /// Fresh correlation id for callers that do not bring their own
    pub fn next_request_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    fn handlers_for(&self, message: &Message) -> Vec<Arc<dyn BusHandler>> {
        lock(&self.subscribers)
            .iter()
            .filter(|s| message.addressed_to(&s.channel))
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Deliver an event to every addressed subscriber. Responses are discarded.
    pub async fn publish(&self, message: Message) {
        let _ = self.tap.send(message.clone());
        for handler in self.handlers_for(&message) {
            let _ = handler.handle(&message).await;
        }
    }

    /// Send a request and wait for the first subscriber that answers it.
    ///
    /// An absent `id` is filled in. A second request with an id still in
    /// flight is rejected.
    pub async fn request(&self, message: Message) -> std::result::Result<Message, EventSystemError> {
        self.request_with_timeout(message, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> std::result::Result<Message, EventSystemError> {
        let id = match message.id.clone() {
            Some(id) => id,
            None => {
                let id = self.next_request_id(&message.src);
                message.id = Some(id.clone());
                id
            }
        };
        message.response = None;

        if !lock(&self.pending).insert(id.clone()) {
            return Err(EventSystemError::DuplicateRequest { id });
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let _ = self.tap.send(message.clone());
        let handlers = self.handlers_for(&message);
        // The responder runs detached so a timed-out caller never cancels it halfway
        let delivered = message.clone();
        let responder = tokio::spawn(async move {
            for handler in handlers {
                if let Some(response) = handler.handle(&delivered).await {
                    return Some(response);
                }
            }
            None
        });
        let answer = tokio::time::timeout(timeout, responder).await;

        match answer {
            Ok(Ok(Some(response))) => {
                let reply = message.respond(&message.dst, response);
                let _ = self.tap.send(reply.clone());
                Ok(reply)
            }
            Ok(Ok(None)) => Err(EventSystemError::NoResponder {
                message_type: message.message_type.clone(),
                dst: message.dst.clone(),
            }),
            Ok(Err(e)) => Err(EventSystemError::ResponderFailed {
                message_type: message.message_type.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EventSystemError::Timeout {
                id,
                message_type: message.message_type.clone(),
                timeout,
            }),
        }
    }

    /// Convenience wrapper returning only the `response` payload
    pub async fn ask(
        &self,
        src: &str,
        dst: &str,
        message_type: &str,
        params: Value,
    ) -> std::result::Result<Value, EventSystemError> {
        let id = self.next_request_id(src);
        let reply = self.request(Message::request(id, src, dst, message_type, params)).await?;
        Ok(reply.response.unwrap_or(Value::Null))
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelComponent for BroadcastBus {
    fn name(&self) -> &'static str {
        "BroadcastBus"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Responder table is per process lifetime and rebuilt on restart
        lock(&self.subscribers).clear();
        lock(&self.pending).clear();
        Ok(())
    }
}
