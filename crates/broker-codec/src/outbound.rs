// Outbound frame construction (spec §4.3). These are the only three frame
// shapes the core ever sends.

use broker_protocol::{ConnectDescriptor, CONNECT_PROTOCOL_VERSION};

/// `connect 31 <json>` — sent once, immediately on socket open.
pub fn connect_frame(descriptor: &ConnectDescriptor) -> String {
    let json = serde_json::to_string(descriptor).expect("ConnectDescriptor always serializes");
    format!("connect {CONNECT_PROTOCOL_VERSION} {json}")
}

/// `sub <id> {"type": "<topic>", ...payload}`.
///
/// `payload`, if given, must serialize to a JSON object; its fields are
/// merged alongside `type`. A non-object payload is folded in under no
/// key and would break the broker's parser, so callers must not pass one —
/// this is enforced by taking `serde_json::Map` rather than `Value`.
pub fn sub_frame(id: u64, topic: &str, payload: Option<serde_json::Map<String, serde_json::Value>>) -> String {
    let mut map = payload.unwrap_or_default();
    map.insert("type".to_owned(), serde_json::Value::String(topic.to_owned()));
    let json = serde_json::to_string(&serde_json::Value::Object(map)).expect("map always serializes");
    format!("sub {id} {json}")
}

/// `unsub <id>`.
pub fn unsub_frame(id: u64) -> String {
    format!("unsub {id}")
}
