use serde_json::json;

use crate::event::types::{Message, PluginEvent, SystemEvent};

#[test]
fn test_event_has_no_id_and_request_has_one() {
    let event = Message::event("plugins", "*", "added", json!({"name": "p"}));
    assert!(event.id.is_none());
    assert!(!event.is_request());

    let request = Message::request("42", "frontend", "plugins", "plugins_get", json!({"name": "p"}));
    assert!(request.is_request());
    assert_eq!(request.param_str("name"), Some("p"));
}

#[test]
fn test_respond_swaps_direction_and_keeps_id() {
    let request = Message::request("7", "frontend", "plugins", "plugins_has", json!({"name": "p"}));
    let reply = request.respond("plugins", json!({"has": true}));

    assert_eq!(reply.id.as_deref(), Some("7"));
    assert_eq!(reply.src, "plugins");
    assert_eq!(reply.dst, "frontend");
    assert!(reply.is_response());
}

#[test]
fn test_addressing_skips_sender_and_honours_wildcard() {
    let broadcast = Message::event("plugins", "*", "started", json!({}));
    assert!(broadcast.addressed_to("frontend"));
    assert!(broadcast.addressed_to("devices"));
    assert!(!broadcast.addressed_to("plugins"));

    let direct = Message::event("frontend", "devices", "devices_list", json!({}));
    assert!(direct.addressed_to("devices"));
    assert!(!direct.addressed_to("plugins"));
}

#[test]
fn test_wire_format_uses_type_key() {
    let request = Message::request("42", "frontend", "plugins", "plugins_get", json!({"name": "p"}));
    let wire = serde_json::to_value(&request).expect("serialize");
    assert_eq!(wire["type"], "plugins_get");
    assert_eq!(wire["id"], "42");
    assert!(wire.get("response").is_none());

    let parsed: Message = serde_json::from_value(wire).expect("deserialize");
    assert_eq!(parsed, request);
}

#[test]
fn test_plugin_event_names() {
    for event in [
        PluginEvent::Added,
        PluginEvent::Removed,
        PluginEvent::Enabled,
        PluginEvent::Disabled,
        PluginEvent::Loaded,
        PluginEvent::Started,
        PluginEvent::Configured,
        PluginEvent::Shutdown,
    ] {
        assert_eq!(PluginEvent::from_name(event.name()), Some(event));
    }
    let message = PluginEvent::Loaded.message("sample");
    assert_eq!(message.params, json!({"name": "sample"}));
    assert_eq!(message.src, "plugins");
    assert_eq!(SystemEvent::Restart.message(json!({})).message_type, "restart");
}
