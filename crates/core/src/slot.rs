//! Slot model, PIN invariant and import/export shapes.
//!
//! A slot is one numbered PIN-code assignment pushed to every managed
//! lock. The invariant enforced here is that a slot is never enabled with
//! a PIN that fails [`is_valid_pin`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::LocklyError;
use crate::types::{SlotId, Timestamp};

// ---------------------------------------------------------------------------
// PIN validation
// ---------------------------------------------------------------------------

/// Accepted PIN format: 4 to 8 ASCII digits.
pub const PIN_PATTERN: &str = r"^\d{4,8}$";

static PIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PIN_PATTERN).expect("valid PIN regex"));

/// Whether `pin` satisfies [`PIN_PATTERN`].
pub fn is_valid_pin(pin: &str) -> bool {
    PIN_RE.is_match(pin)
}

/// Mask a PIN for diagnostic output.
pub fn redact_pin(pin: &str) -> &'static str {
    if pin.is_empty() {
        ""
    } else {
        "***"
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Progress of the most recent apply for a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    #[default]
    #[serde(rename = "")]
    Idle,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "updating")]
    Updating,
    #[serde(rename = "timeout")]
    Timeout,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Idle => "",
            SlotStatus::Queued => "queued",
            SlotStatus::Updating => "updating",
            SlotStatus::Timeout => "timeout",
        }
    }
}

/// Response status recorded when a device confirmed an enable.
pub const RESPONSE_ENABLED: &str = "enabled";
/// Response status recorded when a device confirmed a clear.
pub const RESPONSE_AVAILABLE: &str = "available";
/// Response status for a free-form action that still answered the request.
pub const RESPONSE_UNKNOWN: &str = "unknown";
/// Response status recorded when retries were exhausted.
pub const RESPONSE_TIMEOUT: &str = "timeout";
/// Response status recorded by a dry run.
pub const RESPONSE_SIMULATED: &str = "simulated";

/// Last device acknowledgement recorded on a slot, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl SlotResponse {
    /// A device answered `action`, interpreted as `status`.
    pub fn acknowledged(lock: &str, action: &str, status: &str) -> Self {
        Self {
            lock: Some(lock.to_string()),
            action: Some(action.to_string()),
            status: status.to_string(),
            attempts: None,
        }
    }

    /// A device never answered after `attempts` publishes.
    pub fn timed_out(lock: &str, attempts: u32) -> Self {
        Self {
            lock: Some(lock.to_string()),
            action: None,
            status: RESPONSE_TIMEOUT.to_string(),
            attempts: Some(attempts),
        }
    }

    /// Synthetic response of a dry run.
    pub fn simulated() -> Self {
        Self {
            lock: None,
            action: None,
            status: RESPONSE_SIMULATED.to_string(),
            attempts: None,
        }
    }
}

/// Map a device action name to the slot status it implies.
pub fn response_status_for_action(action: &str) -> &'static str {
    match action {
        crate::activity::ACTION_PIN_CODE_ADDED => RESPONSE_ENABLED,
        crate::activity::ACTION_PIN_CODE_DELETED => RESPONSE_AVAILABLE,
        _ => RESPONSE_UNKNOWN,
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// One persisted slot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(alias = "slot")]
    pub id: SlotId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pin: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub status: SlotStatus,
    #[serde(default, deserialize_with = "lenient_response")]
    pub last_response: Option<SlotResponse>,
    #[serde(default, alias = "last_response_ts", deserialize_with = "lenient_timestamp")]
    pub last_response_timestamp: Option<Timestamp>,
}

// Diagnostics fields never cost a slot its record: unreadable values load
// as `None`.

fn lenient_response<'de, D>(deserializer: D) -> Result<Option<SlotResponse>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Accepts RFC 3339 strings and epoch seconds (integer or fractional).
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(raw) => DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_f64().and_then(epoch_seconds),
        _ => None,
    })
}

fn epoch_seconds(secs: f64) -> Option<Timestamp> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

impl Slot {
    /// A fresh, disabled slot.
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            name: String::new(),
            pin: String::new(),
            enabled: false,
            busy: false,
            status: SlotStatus::Idle,
            last_response: None,
            last_response_timestamp: None,
        }
    }

    pub fn has_valid_pin(&self) -> bool {
        is_valid_pin(&self.pin)
    }

    /// Clear apply bookkeeping left behind by an interrupted run.
    ///
    /// Returns `true` when anything changed.
    pub fn reset_transient(&mut self) -> bool {
        let changed = self.busy || self.status != SlotStatus::Idle;
        self.busy = false;
        self.status = SlotStatus::Idle;
        changed
    }

    /// Record a device response with its timestamp.
    pub fn record_response(&mut self, response: SlotResponse, at: Timestamp) {
        self.last_response = Some(response);
        self.last_response_timestamp = Some(at);
    }
}

/// Operator-editable slot fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlotUpdate {
    pub name: Option<String>,
    pub pin: Option<String>,
    pub enabled: Option<bool>,
}

impl SlotUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.pin.is_none() && self.enabled.is_none()
    }
}

/// Lowest id in `range` that is not taken.
pub fn next_available_slot(
    range: RangeInclusive<SlotId>,
    taken: &BTreeMap<SlotId, Slot>,
) -> Option<SlotId> {
    range.into_iter().find(|id| !taken.contains_key(id))
}

// ---------------------------------------------------------------------------
// Import / export
// ---------------------------------------------------------------------------

/// Serializable snapshot returned by export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotExport {
    pub slot: SlotId,
    pub name: String,
    pub pin: String,
    pub enabled: bool,
}

impl SlotExport {
    pub fn from_slot(slot: &Slot, include_pins: bool) -> Self {
        Self {
            slot: slot.id,
            name: slot.name.clone(),
            pin: if include_pins {
                slot.pin.clone()
            } else {
                String::new()
            },
            enabled: slot.enabled,
        }
    }
}

/// One entry of an import payload. Every field is optional on the wire so
/// a missing id can be reported as [`LocklyError::InvalidSlot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotImport {
    #[serde(default)]
    pub slot: Option<SlotId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Envelope accepted by the JSON import path: `{"slots": [...]}`.
#[derive(Debug, Deserialize)]
pub struct ImportPayload {
    pub slots: Vec<SlotImport>,
}

/// Parse a JSON import payload.
pub fn parse_import_payload(raw: &str) -> Result<Vec<SlotImport>, LocklyError> {
    serde_json::from_str::<ImportPayload>(raw)
        .map(|p| p.slots)
        .map_err(|e| LocklyError::InvalidPayload(e.to_string()))
}

/// Validate a whole import batch and turn it into fresh slot records.
///
/// Nothing is returned unless every entry has an id inside `range`, no id
/// appears twice, and every enabled entry carries a valid PIN.
pub fn build_imported_slots(
    items: &[SlotImport],
    range: RangeInclusive<SlotId>,
) -> Result<Vec<Slot>, LocklyError> {
    let mut seen = BTreeSet::new();
    let mut slots = Vec::with_capacity(items.len());

    for item in items {
        let id = item
            .slot
            .ok_or_else(|| LocklyError::InvalidSlot("missing slot id".into()))?;
        if !range.contains(&id) {
            return Err(LocklyError::InvalidSlot(format!(
                "slot {id} outside range {}-{}",
                range.start(),
                range.end()
            )));
        }
        if !seen.insert(id) {
            return Err(LocklyError::InvalidSlot(format!("slot {id} listed twice")));
        }

        let mut slot = Slot::new(id);
        slot.name = item.name.clone().unwrap_or_default();
        slot.pin = item.pin.clone().unwrap_or_default();
        let enabled = item.enabled.unwrap_or(false);
        if enabled && !slot.has_valid_pin() {
            return Err(LocklyError::InvalidPin(id));
        }
        slot.enabled = enabled;
        slots.push(slot);
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn pin_accepts_four_to_eight_digits() {
        assert!(is_valid_pin("1234"));
        assert!(is_valid_pin("12345678"));
        assert!(!is_valid_pin("12"));
        assert!(!is_valid_pin("123456789"));
        assert!(!is_valid_pin("12a4"));
        assert!(!is_valid_pin(""));
        assert!(!is_valid_pin(" 1234"));
    }

    #[test]
    fn redact_hides_non_empty_pins() {
        assert_eq!(redact_pin("1234"), "***");
        assert_eq!(redact_pin(""), "");
    }

    #[test]
    fn status_serializes_to_wire_strings() {
        assert_eq!(serde_json::to_string(&SlotStatus::Idle).unwrap(), "\"\"");
        assert_eq!(serde_json::to_string(&SlotStatus::Timeout).unwrap(), "\"timeout\"");
        let parsed: SlotStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(parsed, SlotStatus::Queued);
    }

    #[test]
    fn slot_loads_from_flat_record_with_legacy_names() {
        let json = r#"{"slot":3,"name":"Guest","pin":"1234","enabled":true,
            "busy":false,"status":"","last_response":null,"last_response_ts":null}"#;
        let slot: Slot = serde_json::from_str(json).unwrap();
        assert_eq!(slot.id, 3);
        assert_eq!(slot.name, "Guest");
        assert!(slot.enabled);
        assert_eq!(slot.status, SlotStatus::Idle);
    }

    #[test]
    fn epoch_timestamps_load() {
        let json = r#"{"slot":1,"pin":"1234","enabled":true,"last_response_ts":1700000000.5}"#;
        let slot: Slot = serde_json::from_str(json).unwrap();
        let ts = slot.last_response_timestamp.unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);

        let json = r#"{"slot":1,"last_response_ts":1700000000}"#;
        let slot: Slot = serde_json::from_str(json).unwrap();
        assert_eq!(slot.last_response_timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn rfc3339_timestamps_load() {
        let json = r#"{"id":1,"last_response_timestamp":"2026-02-20T10:11:46+01:00"}"#;
        let slot: Slot = serde_json::from_str(json).unwrap();
        assert_eq!(
            slot.last_response_timestamp.unwrap().to_rfc3339(),
            "2026-02-20T09:11:46+00:00"
        );
    }

    #[test]
    fn unreadable_diagnostics_fall_back_to_none() {
        let json = r#"{"slot":5,"name":"Ann","pin":"1234","enabled":true,
            "last_response":"pin_code_added","last_response_ts":"yesterday"}"#;
        let slot: Slot = serde_json::from_str(json).unwrap();
        assert_eq!(slot.id, 5);
        assert!(slot.enabled);
        assert_eq!(slot.last_response, None);
        assert_eq!(slot.last_response_timestamp, None);
    }

    #[test]
    fn reset_transient_reports_changes() {
        let mut slot = Slot::new(1);
        assert!(!slot.reset_transient());
        slot.busy = true;
        slot.status = SlotStatus::Updating;
        assert!(slot.reset_transient());
        assert!(!slot.busy);
        assert_eq!(slot.status, SlotStatus::Idle);
    }

    #[test]
    fn next_available_picks_lowest_gap() {
        let mut taken = BTreeMap::new();
        assert_eq!(next_available_slot(1..=3, &taken), Some(1));
        taken.insert(1, Slot::new(1));
        taken.insert(3, Slot::new(3));
        assert_eq!(next_available_slot(1..=3, &taken), Some(2));
        taken.insert(2, Slot::new(2));
        assert_eq!(next_available_slot(1..=3, &taken), None);
    }

    #[test]
    fn action_maps_to_response_status() {
        assert_eq!(response_status_for_action("pin_code_added"), RESPONSE_ENABLED);
        assert_eq!(response_status_for_action("pin_code_deleted"), RESPONSE_AVAILABLE);
        assert_eq!(response_status_for_action("unlock"), RESPONSE_UNKNOWN);
    }

    #[test]
    fn export_hides_pins_unless_requested() {
        let mut slot = Slot::new(2);
        slot.name = "Guest".into();
        slot.pin = "1234".into();
        slot.enabled = true;
        assert_eq!(SlotExport::from_slot(&slot, false).pin, "");
        assert_eq!(SlotExport::from_slot(&slot, true).pin, "1234");
    }

    #[test]
    fn import_rejects_missing_or_out_of_range_ids() {
        let missing = [SlotImport::default()];
        assert_matches!(build_imported_slots(&missing, 1..=5), Err(LocklyError::InvalidSlot(_)));

        let outside = [SlotImport {
            slot: Some(9),
            ..Default::default()
        }];
        assert_matches!(build_imported_slots(&outside, 1..=5), Err(LocklyError::InvalidSlot(_)));
    }

    #[test]
    fn import_rejects_enabled_slot_with_bad_pin() {
        let items = [
            SlotImport {
                slot: Some(1),
                pin: Some("1234".into()),
                enabled: Some(true),
                ..Default::default()
            },
            SlotImport {
                slot: Some(2),
                pin: Some("12".into()),
                enabled: Some(true),
                ..Default::default()
            },
        ];
        assert_matches!(build_imported_slots(&items, 1..=5), Err(LocklyError::InvalidPin(2)));
    }

    #[test]
    fn import_accepts_disabled_slot_with_bad_pin() {
        let items = [SlotImport {
            slot: Some(4),
            name: Some("Old".into()),
            pin: Some("12".into()),
            enabled: Some(false),
        }];
        let slots = build_imported_slots(&items, 1..=5).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].name, "Old");
        assert!(!slots[0].enabled);
    }

    #[test]
    fn import_rejects_duplicate_ids() {
        let item = SlotImport {
            slot: Some(1),
            ..Default::default()
        };
        let items = [item.clone(), item];
        assert_matches!(build_imported_slots(&items, 1..=5), Err(LocklyError::InvalidSlot(_)));
    }

    #[test]
    fn parse_import_payload_reports_malformed_json() {
        assert_matches!(parse_import_payload("not json"), Err(LocklyError::InvalidPayload(_)));
        let items = parse_import_payload(r#"{"slots":[{"slot":2,"pin":"1234","enabled":true}]}"#)
            .unwrap();
        assert_eq!(items[0].slot, Some(2));
    }
}
