//! Inbound message processing loop.
//!
//! Reads raw bus messages, classifies their topics via [`parse_topic`],
//! records lock activity and routes answers to the [`SlotManager`] for
//! correlation with pending slot commands.

use chrono::Utc;
use lockly_core::activity::{is_activity_action, is_pin_code_action, ActivityEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::manager::SlotManager;
use crate::messages::{parse_action_payload, parse_topic, DeviceTopic, InboundMessage, StateSnapshot};

/// Process bus messages until the channel closes or `cancel` fires.
pub async fn process_messages(
    rx: &mut mpsc::Receiver<InboundMessage>,
    manager: &SlotManager,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Message processing cancelled");
                break;
            }
            msg = rx.recv() => match msg {
                Some(msg) => handle_message(manager, &msg.topic, &msg.payload).await,
                None => {
                    tracing::info!("Message channel closed");
                    break;
                }
            },
        }
    }
}

/// Route a single message to the appropriate handler.
///
/// Topics outside the configured base topic, bridge topics and command
/// topics are ignored.
pub async fn handle_message(manager: &SlotManager, topic: &str, payload: &[u8]) {
    match parse_topic(&manager.config().base_topic, topic) {
        Some(DeviceTopic::Action(device)) => match parse_action_payload(payload) {
            Some(action) => handle_action(manager, &device, &action).await,
            None => tracing::trace!(device = %device, "Empty action payload"),
        },
        Some(DeviceTopic::State(device)) => match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => match StateSnapshot::from_value(&value) {
                Some(snapshot) => handle_state(manager, &device, &snapshot).await,
                None => tracing::debug!(device = %device, "Ignoring non-object state payload"),
            },
            Err(e) => {
                tracing::debug!(device = %device, error = %e, "Ignoring unparseable state payload");
            }
        },
        None => tracing::trace!(topic, "Ignoring topic"),
    }
}

// ---- individual message handlers ----

async fn handle_action(manager: &SlotManager, device: &str, action: &str) {
    tracing::debug!(device, action, "Lock action");
    if is_activity_action(action) {
        manager
            .record_activity(ActivityEvent::new(device, action, Utc::now()))
            .await;
    }
    manager.handle_action(device, action, None).await;
}

async fn handle_state(manager: &SlotManager, device: &str, snapshot: &StateSnapshot) {
    if let Some(action) = snapshot.action.as_deref() {
        if is_activity_action(action) {
            let mut event = ActivityEvent::new(device, action, Utc::now());
            event.source = snapshot.action_source_name.clone();
            event.slot_id = snapshot.action_user;
            if let Some(slot_id) = snapshot.action_user {
                event.user_name = manager.slot_user_name(slot_id).await;
            }
            manager.record_activity(event).await;
        }
        if is_pin_code_action(action) && snapshot.action_user.is_some() {
            manager.handle_action(device, action, snapshot.action_user).await;
        }
    }
    manager.handle_state(device, snapshot).await;
}
