//! Platform events emitted by the slot manager.
//!
//! These are the notifications a UI or host layer subscribes to: slot
//! lifecycle changes, operator-facing validation failures, apply outcomes
//! and recorded lock activity.

use lockly_core::activity::ActivityEvent;
use lockly_core::types::SlotId;
use serde::Serialize;

/// A platform-level event from one installation.
#[derive(Debug, Clone, Serialize)]
pub enum LocklyEvent {
    /// A slot was created by add or import.
    SlotAdded { slot_id: SlotId },

    /// A slot's stored fields or apply status changed.
    SlotUpdated { slot_id: SlotId },

    /// A slot was deleted after its clear completed, or by replace-import.
    SlotRemoved { slot_id: SlotId },

    /// An enable was refused because the PIN fails the format check.
    InvalidPin {
        slot_id: SlotId,
        /// Operator notification text.
        message: String,
    },

    /// Every target device answered or timed out.
    ApplyFinished {
        slot_id: SlotId,
        /// At least one device exhausted its retries.
        timed_out: bool,
    },

    /// A lock reported real-world activity.
    LockActivity(ActivityEvent),
}
