use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::event::dispatcher::BroadcastBus;
use crate::event::error::EventSystemError;
use crate::event::types::Message;
use crate::event::BusHandler;

/// Counts deliveries and answers one request type
struct CountingHandler {
    calls: AtomicU32,
    answers: Option<(&'static str, Value)>,
}

impl CountingHandler {
    fn new(answers: Option<(&'static str, Value)>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), answers })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusHandler for CountingHandler {
    async fn handle(&self, message: &Message) -> Option<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answers {
            Some((message_type, response)) if *message_type == message.message_type => Some(response.clone()),
            _ => None,
        }
    }
}

struct SlowHandler;

#[async_trait]
impl BusHandler for SlowHandler {
    async fn handle(&self, _message: &Message) -> Option<Value> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Some(json!({}))
    }
}

#[tokio::test]
async fn test_event_fans_out_to_addressed_channels_only() {
    let bus = BroadcastBus::new();
    let frontend = CountingHandler::new(None);
    let devices = CountingHandler::new(None);
    let sender = CountingHandler::new(None);
    bus.subscribe("frontend", frontend.clone());
    bus.subscribe("devices", devices.clone());
    bus.subscribe("plugins", sender.clone());

    bus.publish(Message::event("plugins", "*", "added", json!({"name": "p"}))).await;
    assert_eq!(frontend.calls(), 1);
    assert_eq!(devices.calls(), 1);
    assert_eq!(sender.calls(), 0, "sender must not receive its own message");

    bus.publish(Message::event("plugins", "frontend", "added", json!({"name": "p"}))).await;
    assert_eq!(frontend.calls(), 2);
    assert_eq!(devices.calls(), 1);
}

#[tokio::test]
async fn test_request_answered_once_by_first_responder() {
    let bus = BroadcastBus::new();
    let first = CountingHandler::new(Some(("plugins_size", json!({"size": 1}))));
    let second = CountingHandler::new(Some(("plugins_size", json!({"size": 2}))));
    bus.subscribe("plugins", first.clone());
    bus.subscribe("plugins", second.clone());

    let mut tap = bus.watch();
    let reply = bus
        .request(Message::request("42", "frontend", "plugins", "plugins_size", json!({})))
        .await
        .expect("answered");

    assert_eq!(reply.id.as_deref(), Some("42"));
    assert_eq!(reply.response, Some(json!({"size": 1})));
    assert_eq!(second.calls(), 0, "later responders are not consulted");

    let mut responses = 0;
    while let Ok(message) = tap.try_recv() {
        if message.is_response() && message.id.as_deref() == Some("42") {
            responses += 1;
        }
    }
    assert_eq!(responses, 1);
}

#[tokio::test]
async fn test_unknown_type_yields_no_responder() {
    let bus = BroadcastBus::new();
    let handler = CountingHandler::new(Some(("plugins_size", json!({"size": 0}))));
    bus.subscribe("plugins", handler.clone());

    let result = bus
        .request(Message::request("1", "frontend", "plugins", "plugins_bogus", json!({})))
        .await;
    assert!(matches!(result, Err(EventSystemError::NoResponder { .. })));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_request_times_out_and_releases_id() {
    let bus = BroadcastBus::with_timeout(Duration::from_millis(20));
    bus.subscribe("plugins", Arc::new(SlowHandler));

    let result = bus
        .request(Message::request("slow", "frontend", "plugins", "plugins_list", json!({})))
        .await;
    assert!(matches!(result, Err(EventSystemError::Timeout { .. })));

    // The id can be reused once the first request has finished
    let result = bus
        .request(Message::request("slow", "frontend", "plugins", "plugins_list", json!({})))
        .await;
    assert!(matches!(result, Err(EventSystemError::Timeout { .. })));
}

/// Finishes its work some time after being asked
struct LateHandler {
    finished: AtomicU32,
}

#[async_trait]
impl BusHandler for LateHandler {
    async fn handle(&self, _message: &Message) -> Option<Value> {
        tokio::time::sleep(Duration::from_millis(80)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Some(json!({ "done": true }))
    }
}

#[tokio::test]
async fn test_timed_out_request_lets_the_responder_finish() {
    let bus = BroadcastBus::with_timeout(Duration::from_millis(20));
    let handler = Arc::new(LateHandler { finished: AtomicU32::new(0) });
    bus.subscribe("plugins", handler.clone());

    let result = bus
        .request(Message::request("late", "frontend", "plugins", "plugins_start", json!({})))
        .await;
    assert!(matches!(result, Err(EventSystemError::Timeout { .. })));
    assert_eq!(handler.finished.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
}

struct PanickingHandler;

#[async_trait]
impl BusHandler for PanickingHandler {
    async fn handle(&self, _message: &Message) -> Option<Value> {
        panic!("responder blew up");
    }
}

#[tokio::test]
async fn test_panicking_responder_is_reported_as_failure() {
    let bus = BroadcastBus::new();
    bus.subscribe("plugins", Arc::new(PanickingHandler));

    let result = bus
        .request(Message::request("boom", "frontend", "plugins", "plugins_list", json!({})))
        .await;
    assert!(matches!(result, Err(EventSystemError::ResponderFailed { .. })));
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_rejected() {
    let bus = Arc::new(BroadcastBus::with_timeout(Duration::from_millis(200)));
    bus.subscribe("plugins", Arc::new(SlowHandler));

    let in_flight = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.request(Message::request("dup", "frontend", "plugins", "plugins_list", json!({})))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = bus
        .request(Message::request("dup", "frontend", "plugins", "plugins_list", json!({})))
        .await;
    assert!(matches!(second, Err(EventSystemError::DuplicateRequest { .. })));
    let _ = in_flight.await;
}

#[tokio::test]
async fn test_missing_id_is_generated() {
    let bus = BroadcastBus::new();
    bus.subscribe("devices", CountingHandler::new(Some(("devices_length", json!({"length": 0})))));

    let response = bus.ask("frontend", "devices", "devices_length", json!({})).await.expect("answered");
    assert_eq!(response, json!({"length": 0}));
}

#[tokio::test]
async fn test_unsubscribe() {
    let bus = BroadcastBus::new();
    let handler = CountingHandler::new(None);
    let id = bus.subscribe("frontend", handler.clone());
    assert_eq!(bus.subscriber_count(), 1);

    bus.unsubscribe(id).expect("registered");
    bus.publish(Message::event("plugins", "*", "added", json!({}))).await;
    assert_eq!(handler.calls(), 0);
    assert!(matches!(bus.unsubscribe(id), Err(EventSystemError::UnknownSubscriber { .. })));
}
