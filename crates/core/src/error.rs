use crate::types::SlotId;

/// Operator-facing failures of the slot manager.
///
/// Every variant is a synchronous validation failure surfaced to the
/// caller; transport failures and device anomalies never end up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocklyError {
    #[error("Slot {0} not found")]
    SlotNotFound(SlotId),

    #[error("No available slots in the configured range")]
    NoAvailableSlots,

    #[error("No locks configured or resolved for this operation")]
    NoLocksConfigured,

    #[error("Slot {0}: PIN must be 4-8 digits (numbers only)")]
    InvalidPin(SlotId),

    #[error("Invalid slot: {0}")]
    InvalidSlot(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Slot manager is stopped")]
    Stopped,
}

impl LocklyError {
    /// Stable machine-readable code, used as a translation key by UIs.
    pub fn code(&self) -> &'static str {
        match self {
            LocklyError::SlotNotFound(_) => "slot_not_found",
            LocklyError::NoAvailableSlots => "no_available_slots",
            LocklyError::NoLocksConfigured => "no_locks_configured",
            LocklyError::InvalidPin(_) => "invalid_pin",
            LocklyError::InvalidSlot(_) => "invalid_slot",
            LocklyError::InvalidPayload(_) => "invalid_payload",
            LocklyError::Storage(_) => "storage_error",
            LocklyError::Stopped => "manager_stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(LocklyError::SlotNotFound(3).code(), "slot_not_found");
        assert_eq!(LocklyError::NoAvailableSlots.code(), "no_available_slots");
        assert_eq!(LocklyError::NoLocksConfigured.code(), "no_locks_configured");
        assert_eq!(LocklyError::InvalidPin(1).code(), "invalid_pin");
        assert_eq!(LocklyError::Stopped.code(), "manager_stopped");
    }

    #[test]
    fn invalid_pin_message_names_the_slot() {
        let msg = LocklyError::InvalidPin(7).to_string();
        assert!(msg.starts_with("Slot 7:"), "got {msg}");
    }
}
