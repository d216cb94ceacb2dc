//! Acknowledgement correlation.
//!
//! Locks answer pin-code commands asynchronously, on two channels, with no
//! request id. The [`Correlator`] keeps, per device, the FIFO of slots
//! awaiting an answer and, per `(slot, device)`, the [`PendingRequest`]
//! with its retry counter and armed timer. Answers are matched to the
//! oldest pending slot of the device unless the device names the slot
//! explicitly.
//!
//! The correlator is plain state; the slot manager owns it behind its
//! state mutex and drives timers and fan-in around it.

use std::collections::{HashMap, VecDeque};

use lockly_core::activity::{ACTION_PIN_CODE_ADDED, ACTION_PIN_CODE_DELETED};
use lockly_core::command::PinCodeCommand;
use lockly_core::types::SlotId;
use tokio::task::AbortHandle;

use crate::messages::StateSnapshot;

/// Key of one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub slot_id: SlotId,
    pub device: String,
}

impl RequestKey {
    pub fn new(slot_id: SlotId, device: impl Into<String>) -> Self {
        Self {
            slot_id,
            device: device.into(),
        }
    }
}

/// Channel an answer arrived on, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerChannel {
    Action,
    State,
}

impl AnswerChannel {
    fn as_str(self) -> &'static str {
        match self {
            AnswerChannel::Action => "action",
            AnswerChannel::State => "state",
        }
    }
}

/// A timeout task armed for one publish attempt.
#[derive(Debug)]
pub struct ArmedTimer {
    pub id: u64,
    handle: AbortHandle,
}

/// One `(slot, device)` request awaiting an answer.
#[derive(Debug)]
pub struct PendingRequest {
    /// Retries already performed.
    pub attempts: u32,
    /// Exact command last sent.
    pub command: PinCodeCommand,
    pub timer: Option<ArmedTimer>,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

/// Correlation tables of one installation.
#[derive(Debug, Default)]
pub struct Correlator {
    by_device: HashMap<String, VecDeque<SlotId>>,
    pending: HashMap<RequestKey, PendingRequest>,
    next_timer_id: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `command` is about to be sent to `device` for `slot_id`.
    pub fn register(&mut self, slot_id: SlotId, device: &str, command: PinCodeCommand) {
        self.by_device
            .entry(device.to_string())
            .or_default()
            .push_back(slot_id);
        let previous = self.pending.insert(
            RequestKey::new(slot_id, device),
            PendingRequest {
                attempts: 0,
                command,
                timer: None,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
        }
    }

    pub fn pending(&self, key: &RequestKey) -> Option<&PendingRequest> {
        self.pending.get(key)
    }

    pub fn pending_mut(&mut self, key: &RequestKey) -> Option<&mut PendingRequest> {
        self.pending.get_mut(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Slots awaiting an answer from `device`, oldest first.
    pub fn queued_slots(&self, device: &str) -> Vec<SlotId> {
        self.by_device
            .get(device)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `key` is pending without an armed timer.
    pub fn needs_timer(&self, key: &RequestKey) -> bool {
        self.pending.get(key).is_some_and(|p| p.timer.is_none())
    }

    /// Allocate an id for a timer about to be armed.
    pub fn next_timer_id(&mut self) -> u64 {
        self.next_timer_id += 1;
        self.next_timer_id
    }

    /// Attach an armed timer to `key`. The handle is aborted when `key` is
    /// no longer pending.
    pub fn set_timer(&mut self, key: &RequestKey, id: u64, handle: AbortHandle) {
        match self.pending.get_mut(key) {
            Some(pending) => {
                pending.cancel_timer();
                pending.timer = Some(ArmedTimer { id, handle });
            }
            None => handle.abort(),
        }
    }

    /// Claim the timer `id` of `key` when it fires.
    ///
    /// Returns `false` for a stale timer: the request was answered, retried
    /// or replaced after the timer was armed.
    pub fn claim_fired_timer(&mut self, key: &RequestKey, id: u64) -> bool {
        match self.pending.get_mut(key) {
            Some(pending) if pending.timer.as_ref().is_some_and(|t| t.id == id) => {
                pending.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Pick the slot an answer from `device` refers to.
    ///
    /// With an explicit slot id the slot is removed from anywhere in the
    /// device queue; without one the oldest slot is taken. `None` means the
    /// answer is stale or unsolicited.
    pub fn dequeue(
        &mut self,
        device: &str,
        action: &str,
        explicit_slot: Option<SlotId>,
        channel: AnswerChannel,
    ) -> Option<SlotId> {
        let Some(queue) = self.by_device.get_mut(device).filter(|q| !q.is_empty()) else {
            tracing::debug!(
                device,
                action,
                channel = channel.as_str(),
                "Answer ignored, no pending slot",
            );
            return None;
        };

        let slot_id = match explicit_slot {
            None => queue.pop_front()?,
            Some(wanted) => match queue.iter().position(|id| *id == wanted) {
                Some(index) => queue.remove(index)?,
                None => {
                    tracing::debug!(
                        device,
                        action,
                        slot_id = wanted,
                        channel = channel.as_str(),
                        "Answer ignored, slot not pending",
                    );
                    return None;
                }
            },
        };

        if queue.is_empty() {
            self.by_device.remove(device);
        }
        tracing::debug!(
            device,
            slot_id,
            action,
            channel = channel.as_str(),
            "Dequeued pending slot",
        );
        Some(slot_id)
    }

    /// Match a state snapshot against the oldest pending slot of `device`.
    ///
    /// The snapshot confirms the request when the head request has an armed
    /// timer and the `users` entry of its slot shows the state the command
    /// asked for: `enabled` for an enable, `available` or `disabled` for a
    /// clear. Returns the slot and the action name the answer stands for.
    pub fn match_state(&self, device: &str, snapshot: &StateSnapshot) -> Option<(SlotId, &'static str)> {
        let head = *self.by_device.get(device)?.front()?;
        snapshot.users.as_ref()?;
        let pending = self.pending.get(&RequestKey::new(head, device))?;
        pending.timer.as_ref()?;
        let status = snapshot.user_status(head)?;

        let enabling = pending.command.is_enable();
        let expected: &[&str] = if enabling {
            &["enabled"]
        } else {
            &["available", "disabled"]
        };
        if !expected.contains(&status) {
            return None;
        }
        let action = if enabling {
            ACTION_PIN_CODE_ADDED
        } else {
            ACTION_PIN_CODE_DELETED
        };
        Some((head, action))
    }

    /// Drop the request for `key`, cancelling its timer.
    pub fn take(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        let mut pending = self.pending.remove(key)?;
        pending.cancel_timer();
        Some(pending)
    }

    /// Remove `slot_id` from the queue of `device` without an answer.
    pub fn forget_queued(&mut self, device: &str, slot_id: SlotId) {
        if let Some(queue) = self.by_device.get_mut(device) {
            queue.retain(|id| *id != slot_id);
            if queue.is_empty() {
                self.by_device.remove(device);
            }
        }
    }

    /// Abort every armed timer and forget all requests.
    pub fn clear(&mut self) {
        for pending in self.pending.values_mut() {
            pending.cancel_timer();
        }
        self.pending.clear();
        self.by_device.clear();
    }
}
