//! Lock activity event model.

use serde::{Deserialize, Serialize};

use crate::types::{SlotId, Timestamp};

pub const ACTION_LOCK: &str = "lock";
pub const ACTION_UNLOCK: &str = "unlock";
pub const ACTION_MANUAL_LOCK: &str = "manual_lock";
pub const ACTION_MANUAL_UNLOCK: &str = "manual_unlock";
pub const ACTION_ONE_TOUCH_LOCK: &str = "one_touch_lock";
pub const ACTION_PIN_CODE_ADDED: &str = "pin_code_added";
pub const ACTION_PIN_CODE_DELETED: &str = "pin_code_deleted";

/// Actions a z2m lock reports for real-world activity.
pub const LOCK_ACTIONS: &[&str] = &[
    ACTION_LOCK,
    ACTION_UNLOCK,
    "lock_failure_invalid_pin_or_id",
    "lock_failure_invalid_schedule",
    "unlock_failure_invalid_pin_or_id",
    "unlock_failure_invalid_schedule",
    ACTION_ONE_TOUCH_LOCK,
    "key_lock",
    "key_unlock",
    "auto_lock",
    "schedule_lock",
    "schedule_unlock",
    ACTION_MANUAL_LOCK,
    ACTION_MANUAL_UNLOCK,
    "non_access_user_operational_event",
];

/// Whether `action` is a lock activity action (PIN management excluded).
pub fn is_lock_action(action: &str) -> bool {
    LOCK_ACTIONS.contains(&action)
}

/// Whether `action` is worth recording in the activity log.
pub fn is_activity_action(action: &str) -> bool {
    is_lock_action(action) || is_pin_code_action(action)
}

pub fn is_pin_code_action(action: &str) -> bool {
    action == ACTION_PIN_CODE_ADDED || action == ACTION_PIN_CODE_DELETED
}

/// One recorded lock action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub lock: String,
    pub action: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
}

impl ActivityEvent {
    pub fn new(lock: impl Into<String>, action: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            lock: lock.into(),
            action: action.into(),
            timestamp,
            source: None,
            user_name: None,
            slot_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_slot(mut self, slot_id: SlotId) -> Self {
        self.slot_id = Some(slot_id);
        self
    }

    /// Fill attribution this event lacks from `other`.
    pub fn backfill_from(&mut self, other: &ActivityEvent) {
        if self.user_name.is_none() {
            self.user_name.clone_from(&other.user_name);
        }
        if self.slot_id.is_none() {
            self.slot_id = other.slot_id;
        }
    }
}
