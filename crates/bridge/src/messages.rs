//! Inbound z2m message types and parser.
//!
//! z2m publishes two streams per device under the base topic `B`:
//!
//! * `B/<device>/action` carries a bare action name (`unlock`,
//!   `pin_code_added`, ...).
//! * `B/<device>` carries a JSON state snapshot, optionally with the last
//!   `action`, its `action_user` and `action_source_name`, and a `users`
//!   map of per-slot PIN states.

use lockly_core::types::SlotId;
use serde_json::{Map, Value};

const ACTION_SUFFIX: &str = "/action";
const BRIDGE_DEVICE: &str = "bridge";

/// A raw message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Which device stream a topic belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTopic {
    Action(String),
    State(String),
}

/// Classify `topic` under `base_topic`. Bridge, command and unrelated
/// topics yield `None`.
pub fn parse_topic(base_topic: &str, topic: &str) -> Option<DeviceTopic> {
    let rest = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    if let Some(device) = rest.strip_suffix(ACTION_SUFFIX) {
        if device.is_empty() || device.contains('/') || device == BRIDGE_DEVICE {
            return None;
        }
        return Some(DeviceTopic::Action(device.to_string()));
    }
    if rest.is_empty() || rest.contains('/') || rest == BRIDGE_DEVICE {
        return None;
    }
    Some(DeviceTopic::State(rest.to_string()))
}

/// The fields of a state snapshot Lockly reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub action: Option<String>,
    pub action_user: Option<SlotId>,
    pub action_source_name: Option<String>,
    pub users: Option<Map<String, Value>>,
}

impl StateSnapshot {
    /// Extract the snapshot fields, tolerating odd types.
    pub fn from_value(payload: &Value) -> Option<Self> {
        let obj = payload.as_object()?;
        Some(Self {
            action: obj
                .get("action")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            action_user: obj.get("action_user").and_then(parse_slot_id),
            action_source_name: obj
                .get("action_source_name")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            users: obj.get("users").and_then(Value::as_object).cloned(),
        })
    }

    /// Status reported for `slot_id` in the `users` map, if any.
    pub fn user_status(&self, slot_id: SlotId) -> Option<&str> {
        self.users
            .as_ref()?
            .get(&slot_id.to_string())?
            .as_object()?
            .get("status")?
            .as_str()
            .filter(|s| !s.is_empty())
    }
}

/// Slot id from an integer or a digit string.
pub fn parse_slot_id(value: &Value) -> Option<SlotId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| SlotId::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Action name from an action-topic payload.
pub fn parse_action_payload(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    let action = text.trim().trim_matches('"').trim();
    (!action.is_empty()).then(|| action.to_string())
}
