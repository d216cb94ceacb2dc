//! Pin-code command payloads published to lock devices.
//!
//! The wire shape is the z2m `pin_code` converter input:
//!
//! ```json
//! {"pin_code": {"user": 3, "user_type": "unrestricted", "user_enabled": true, "pin_code": "1234"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::slot::{redact_pin, Slot};
use crate::types::SlotId;

/// User type sent with every pin-code command.
pub const USER_TYPE_UNRESTRICTED: &str = "unrestricted";

/// Inner `pin_code` object of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCode {
    pub user: SlotId,
    pub user_type: String,
    pub user_enabled: bool,
    pub pin_code: Option<String>,
}

/// A command that sets or clears one slot on one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCodeCommand {
    pub pin_code: PinCode,
}

impl PinCodeCommand {
    /// Command that stores `pin` in `slot_id` and enables it.
    pub fn enable(slot_id: SlotId, pin: impl Into<String>) -> Self {
        Self {
            pin_code: PinCode {
                user: slot_id,
                user_type: USER_TYPE_UNRESTRICTED.to_string(),
                user_enabled: true,
                pin_code: Some(pin.into()),
            },
        }
    }

    /// Command that clears `slot_id`.
    pub fn clear(slot_id: SlotId) -> Self {
        Self {
            pin_code: PinCode {
                user: slot_id,
                user_type: USER_TYPE_UNRESTRICTED.to_string(),
                user_enabled: false,
                pin_code: None,
            },
        }
    }

    /// Build the command applying `slot`'s desired state.
    ///
    /// A disabled slot, or any force-clear, produces a clear.
    pub fn for_slot(slot: &Slot, force_clear: bool) -> Self {
        if force_clear || !slot.enabled {
            Self::clear(slot.id)
        } else {
            Self::enable(slot.id, slot.pin.clone())
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.pin_code.user
    }

    /// Whether this command enables its slot.
    pub fn is_enable(&self) -> bool {
        self.pin_code.user_enabled
    }

    /// Copy of the command safe to log. Clears carry no PIN and are
    /// returned as sent.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(pin) = copy.pin_code.pin_code.as_mut() {
            *pin = redact_pin(pin).to_string();
        }
        copy
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "pin_code": {
                "user": self.pin_code.user,
                "user_type": self.pin_code.user_type,
                "user_enabled": self.pin_code.user_enabled,
                "pin_code": self.pin_code.pin_code,
            }
        })
    }
}
