//! Human-readable activity descriptions, e.g. "unlocked by Ann via keypad".

use serde::Serialize;

use crate::activity::ActivityEvent;

/// Rendered description of one activity event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityDescription {
    /// Lock display name.
    pub name: String,
    pub message: String,
}

fn action_label(action: &str) -> String {
    let label = match action {
        "lock" | "manual_lock" => "locked",
        "unlock" | "manual_unlock" => "unlocked",
        "auto_lock" => "auto-locked",
        "key_lock" => "locked with key",
        "key_unlock" => "unlocked with key",
        "one_touch_lock" => "one-touch locked",
        "schedule_lock" => "schedule locked",
        "schedule_unlock" => "schedule unlocked",
        other => return other.replace('_', " "),
    };
    label.to_string()
}

fn source_label(source: &str) -> &str {
    match source {
        "keypad" => "keypad",
        "rfid" => "RFID",
        "manual" => "manual",
        "rf" | "remote" | "automation" => "automation",
        other => other,
    }
}

/// Describe `event` as `<label> [by <user>] [via <source>]`.
///
/// The user falls back to "Slot N" when only the slot id is known.
pub fn describe(event: &ActivityEvent) -> ActivityDescription {
    let mut parts = vec![action_label(&event.action)];

    let user = match (&event.user_name, event.slot_id) {
        (Some(name), _) if !name.is_empty() => Some(name.clone()),
        (_, Some(slot_id)) => Some(format!("Slot {slot_id}")),
        _ => None,
    };
    if let Some(user) = user {
        parts.push(format!("by {user}"));
    }

    if let Some(source) = event.source.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("via {}", source_label(source)));
    }

    ActivityDescription {
        name: event.lock.clone(),
        message: parts.join(" "),
    }
}
