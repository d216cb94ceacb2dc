//! Integration tests for `SlotManager`.
//!
//! These tests drive the manager end to end against an in-memory store and
//! a recording publisher. Device answers are injected through the message
//! processor the same way bus traffic would arrive.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use lockly_bridge::events::LocklyEvent;
use lockly_bridge::manager::{ApplyOptions, SlotManager};
use lockly_bridge::processor::handle_message;
use lockly_bridge::publisher::{CommandPublisher, PublishError};
use lockly_bridge::{LocklyConfig, StaticDirectory};
use lockly_core::error::LocklyError;
use lockly_core::slot::{SlotImport, SlotStatus, SlotUpdate};
use lockly_core::types::SlotId;
use lockly_store::MemoryStore;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct RecordingPublisher {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &Value, _qos: u8) -> Result<(), PublishError> {
        let _ = self.tx.send((topic.to_string(), payload.clone()));
        Ok(())
    }
}

struct Harness {
    manager: Arc<SlotManager>,
    published: mpsc::UnboundedReceiver<(String, Value)>,
    events: broadcast::Receiver<LocklyEvent>,
    store: Arc<MemoryStore>,
}

fn config(locks: &[&str]) -> LocklyConfig {
    LocklyConfig {
        lock_names: locks.iter().map(|l| l.to_string()).collect(),
        action_timeout: Duration::from_secs(10),
        max_retries: 0,
        ..Default::default()
    }
}

async fn harness_with_store(config: LocklyConfig, store: Arc<MemoryStore>) -> Harness {
    let (tx, published) = mpsc::unbounded_channel();
    let manager = SlotManager::start(
        config,
        Arc::new(RecordingPublisher { tx }),
        store.clone(),
        Arc::new(StaticDirectory::new()),
    )
    .await
    .unwrap();
    let events = manager.subscribe();
    Harness {
        manager,
        published,
        events,
        store,
    }
}

async fn harness(config: LocklyConfig) -> Harness {
    harness_with_store(config, Arc::new(MemoryStore::new())).await
}

/// Add a slot holding a valid, enabled PIN.
async fn add_enabled(manager: &SlotManager, name: &str, pin: &str) -> SlotId {
    let slot_id = manager.add_slot().await.unwrap();
    manager
        .update_slot(
            slot_id,
            SlotUpdate {
                name: Some(name.into()),
                pin: Some(pin.into()),
                enabled: Some(true),
            },
        )
        .await
        .unwrap();
    slot_id
}

fn no_wait() -> ApplyOptions {
    ApplyOptions {
        wait_for_completion: false,
        ..Default::default()
    }
}

/// Wait for the next `ApplyFinished` event.
async fn next_finished(events: &mut broadcast::Receiver<LocklyEvent>) -> (SlotId, bool) {
    loop {
        if let LocklyEvent::ApplyFinished { slot_id, timed_out } = events.recv().await.unwrap() {
            return (slot_id, timed_out);
        }
    }
}

// ---------------------------------------------------------------------------
// Test: a state snapshot confirms an enable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn apply_confirmed_by_state_snapshot() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    let manager = h.manager.clone();
    let apply = tokio::spawn(async move { manager.apply_slot(slot_id, ApplyOptions::default()).await });

    let (topic, payload) = h.published.recv().await.unwrap();
    assert_eq!(topic, "zigbee2mqtt/Front/set");
    assert_eq!(
        payload,
        json!({"pin_code": {"user": 1, "user_type": "unrestricted", "user_enabled": true, "pin_code": "1234"}})
    );
    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(slot.busy);
    assert_eq!(slot.status, SlotStatus::Updating);

    handle_message(
        &h.manager,
        "zigbee2mqtt/Front",
        br#"{"users": {"1": {"status": "enabled"}}, "battery": 90}"#,
    )
    .await;
    apply.await.unwrap().unwrap();

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.status, SlotStatus::Idle);
    let response = slot.last_response.unwrap();
    assert_eq!(response.status, "enabled");
    assert_eq!(response.lock.as_deref(), Some("Front"));
    assert_eq!(response.action.as_deref(), Some("pin_code_added"));
    assert!(slot.last_response_timestamp.is_some());

    let stored = h.store.get("lockly_slots.default").await.unwrap();
    assert_eq!(stored[0]["busy"], json!(false));
    assert_eq!(stored[0]["pin"], json!("1234"));
}

// ---------------------------------------------------------------------------
// Test: an action-topic answer completes the oldest pending slot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn action_topic_answer_completes_apply() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager.apply_slot(slot_id, no_wait()).await.unwrap();
    h.published.recv().await.unwrap();

    handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_added").await;
    assert_eq!(next_finished(&mut h.events).await, (slot_id, false));

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.last_response.unwrap().status, "enabled");

    // The answer is lock activity as well.
    let activity = h.manager.activity().raw().await;
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].action, "pin_code_added");
}

// ---------------------------------------------------------------------------
// Test: an explicit action_user on the state topic completes that slot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_action_user_completes_named_slot() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager.apply_slot(slot_id, no_wait()).await.unwrap();
    h.published.recv().await.unwrap();

    handle_message(
        &h.manager,
        "zigbee2mqtt/Front",
        br#"{"action": "pin_code_added", "action_user": 1}"#,
    )
    .await;
    assert_eq!(next_finished(&mut h.events).await, (slot_id, false));

    let activity = h.manager.activity().raw().await;
    assert_eq!(activity[0].slot_id, Some(slot_id));
    assert_eq!(activity[0].user_name.as_deref(), Some("Alice"));
}

// ---------------------------------------------------------------------------
// Test: remove clears the devices first and deletes afterwards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_deletes_after_clear_confirmed() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    let manager = h.manager.clone();
    let remove = tokio::spawn(async move { manager.remove_slot(slot_id, None, false).await });

    let (_, payload) = h.published.recv().await.unwrap();
    assert_eq!(payload["pin_code"]["user_enabled"], json!(false));
    assert_eq!(payload["pin_code"]["pin_code"], Value::Null);
    assert!(h.manager.slot(slot_id).await.is_some());

    handle_message(
        &h.manager,
        "zigbee2mqtt/Front",
        br#"{"users": {"1": {"status": "available"}}}"#,
    )
    .await;
    remove.await.unwrap().unwrap();

    assert!(h.manager.slot(slot_id).await.is_none());
    let mut removed = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, LocklyEvent::SlotRemoved { slot_id: id } if id == slot_id) {
            removed = true;
        }
    }
    assert!(removed);
    assert_eq!(h.store.get("lockly_slots.default").await.unwrap(), json!([]));
}

// ---------------------------------------------------------------------------
// Test: an unanswered command is retried, then marked timed out
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unanswered_command_retries_then_times_out() {
    let mut cfg = config(&["Front"]);
    cfg.max_retries = 1;
    let mut h = harness(cfg).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    let manager = h.manager.clone();
    let apply = tokio::spawn(async move { manager.apply_slot(slot_id, ApplyOptions::default()).await });

    let (_, first) = h.published.recv().await.unwrap();
    let (_, second) = h.published.recv().await.unwrap();
    assert_eq!(first, second);
    apply.await.unwrap().unwrap();

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.status, SlotStatus::Timeout);
    let response = slot.last_response.unwrap();
    assert_eq!(response.status, "timeout");
    assert_eq!(response.attempts, Some(2));
    assert!(h.published.try_recv().is_err());

    // A late answer finds nothing pending.
    assert!(!h.manager.handle_action("Front", "pin_code_added", None).await);
}

// ---------------------------------------------------------------------------
// Test: a fan-in waits for every device
// ---------------------------------------------------------------------------

#[tokio::test]
async fn apply_waits_for_every_device() {
    let mut h = harness(config(&["Front", "Back"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager.apply_slot(slot_id, no_wait()).await.unwrap();
    let mut topics = vec![
        h.published.recv().await.unwrap().0,
        h.published.recv().await.unwrap().0,
    ];
    topics.sort();
    assert_eq!(topics, vec!["zigbee2mqtt/Back/set", "zigbee2mqtt/Front/set"]);

    handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_added").await;
    assert!(h.manager.slot(slot_id).await.unwrap().busy);

    handle_message(&h.manager, "zigbee2mqtt/Back/action", b"pin_code_added").await;
    assert_eq!(next_finished(&mut h.events).await, (slot_id, false));
    assert!(!h.manager.slot(slot_id).await.unwrap().busy);
}

// ---------------------------------------------------------------------------
// Test: one device answers, another times out
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_finish_as_timeout() {
    let mut cfg = config(&["Front", "Back"]);
    cfg.max_retries = 1;
    let mut h = harness(cfg).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    let started = tokio::time::Instant::now();
    let manager = h.manager.clone();
    let apply = tokio::spawn(async move { manager.apply_slot(slot_id, ApplyOptions::default()).await });

    let mut topics = vec![
        h.published.recv().await.unwrap().0,
        h.published.recv().await.unwrap().0,
    ];
    topics.sort();
    assert_eq!(topics, vec!["zigbee2mqtt/Back/set", "zigbee2mqtt/Front/set"]);

    handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_added").await;
    assert!(!apply.is_finished());
    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(slot.busy);
    assert_eq!(slot.last_response.unwrap().lock.as_deref(), Some("Front"));

    // Only the silent device is retried.
    let (retry_topic, _) = h.published.recv().await.unwrap();
    assert_eq!(retry_topic, "zigbee2mqtt/Back/set");

    apply.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(h.published.try_recv().is_err());

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.status, SlotStatus::Timeout);
    let response = slot.last_response.unwrap();
    assert_eq!(response.status, "timeout");
    assert_eq!(response.lock.as_deref(), Some("Back"));
    assert_eq!(response.attempts, Some(2));
}

// ---------------------------------------------------------------------------
// Test: jobs run one at a time
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_job_waits_for_first() {
    let mut h = harness(config(&["Front"])).await;
    let first = add_enabled(&h.manager, "Alice", "1234").await;
    let second = add_enabled(&h.manager, "Bob", "5678").await;

    h.manager.apply_slot(first, no_wait()).await.unwrap();
    h.manager.apply_slot(second, no_wait()).await.unwrap();

    let (_, payload) = h.published.recv().await.unwrap();
    assert_eq!(payload["pin_code"]["user"], json!(first));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.published.try_recv().is_err());
    assert_eq!(h.manager.slot(second).await.unwrap().status, SlotStatus::Queued);

    handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_added").await;
    let (_, payload) = h.published.recv().await.unwrap();
    assert_eq!(payload["pin_code"]["user"], json!(second));
}

// ---------------------------------------------------------------------------
// Test: invalid PINs are refused
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enabling_with_invalid_pin_is_refused() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = h.manager.add_slot().await.unwrap();

    let err = h
        .manager
        .update_slot(
            slot_id,
            SlotUpdate {
                pin: Some("12".into()),
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LocklyError::InvalidPin(slot_id));

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.enabled);
    assert_eq!(slot.pin, "12");

    let mut notified = false;
    while let Ok(event) = h.events.try_recv() {
        if let LocklyEvent::InvalidPin { slot_id: id, message } = event {
            assert_eq!(id, slot_id);
            assert!(message.contains("4-8 digits"));
            notified = true;
        }
    }
    assert!(notified);
}

#[tokio::test]
async fn apply_of_stored_invalid_pin_is_refused() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "lockly_slots.default",
            json!([{"slot": 1, "name": "Legacy", "pin": "12ab", "enabled": true, "busy": true, "status": "updating"}]),
        )
        .await;
    let mut h = harness_with_store(config(&["Front"]), store).await;

    let slot = h.manager.slot(1).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.status, SlotStatus::Idle);

    let err = h.manager.apply_slot(1, ApplyOptions::default()).await.unwrap_err();
    assert_eq!(err, LocklyError::InvalidPin(1));
    assert!(h.published.try_recv().is_err());

    // Clearing does not need a valid PIN.
    h.manager
        .apply_slot(
            1,
            ApplyOptions {
                force_clear: true,
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test: request validation errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn apply_validation_errors() {
    let h = harness(config(&[])).await;
    assert_matches!(
        h.manager.apply_slot(9, ApplyOptions::default()).await,
        Err(LocklyError::SlotNotFound(9))
    );

    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;
    assert_matches!(
        h.manager.apply_slot(slot_id, ApplyOptions::default()).await,
        Err(LocklyError::NoLocksConfigured)
    );
}

#[tokio::test]
async fn add_slot_fills_range_then_fails() {
    let mut cfg = config(&["Front"]);
    cfg.first_slot = 3;
    cfg.last_slot = 4;
    let h = harness(cfg).await;

    assert_eq!(h.manager.add_slot().await.unwrap(), 3);
    assert_eq!(h.manager.add_slot().await.unwrap(), 4);
    assert_matches!(h.manager.add_slot().await, Err(LocklyError::NoAvailableSlots));
}

// ---------------------------------------------------------------------------
// Test: dry runs never publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_records_simulated_response() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager
        .apply_slot(
            slot_id,
            ApplyOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.last_response.unwrap().status, "simulated");
    assert!(h.published.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test: apply_all only touches enabled slots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn apply_all_skips_disabled_slots() {
    let mut h = harness(config(&["Front"])).await;
    let enabled = add_enabled(&h.manager, "Alice", "1234").await;
    let disabled = h.manager.add_slot().await.unwrap();

    h.manager.apply_all(None, false).await.unwrap();
    let (_, payload) = h.published.recv().await.unwrap();
    assert_eq!(payload["pin_code"]["user"], json!(enabled));

    handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_added").await;
    assert_eq!(next_finished(&mut h.events).await, (enabled, false));

    let slot = h.manager.slot(disabled).await.unwrap();
    assert!(!slot.busy);
    assert!(slot.last_response.is_none());
}

// ---------------------------------------------------------------------------
// Test: acknowledgements can be skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skip_timeout_finishes_without_answers() {
    let mut cfg = config(&["Front"]);
    cfg.skip_timeout = true;
    let mut h = harness(cfg).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager.apply_slot(slot_id, ApplyOptions::default()).await.unwrap();
    h.published.recv().await.unwrap();

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert!(!h.manager.handle_action("Front", "pin_code_added", None).await);
}

// ---------------------------------------------------------------------------
// Test: import and export
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_replace_and_export() {
    let h = harness(config(&["Front"])).await;
    add_enabled(&h.manager, "Old", "1111").await;

    h.manager
        .import_slots_json(
            r#"{"slots": [
                {"slot": 2, "name": "Alice", "pin": "1234", "enabled": true},
                {"slot": 5, "name": "Bob"}
            ]}"#,
            true,
        )
        .await
        .unwrap();

    let exported = h.manager.export_slots(false).await;
    let ids: Vec<SlotId> = exported.iter().map(|e| e.slot).collect();
    assert_eq!(ids, vec![2, 5]);
    assert_eq!(exported[0].pin, "");
    assert!(exported[0].enabled);

    let with_pins = h.manager.export_slots(true).await;
    assert_eq!(with_pins[0].pin, "1234");
}

#[tokio::test]
async fn invalid_import_changes_nothing() {
    let h = harness(config(&["Front"])).await;
    add_enabled(&h.manager, "Alice", "1234").await;

    let batch = vec![
        SlotImport {
            slot: Some(2),
            name: Some("Bob".into()),
            ..Default::default()
        },
        SlotImport {
            slot: Some(3),
            pin: Some("12".into()),
            enabled: Some(true),
            ..Default::default()
        },
    ];
    assert_matches!(
        h.manager.import_slots(batch, true).await,
        Err(LocklyError::InvalidPin(3))
    );
    let slots = h.manager.slots().await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].name, "Alice");

    assert_matches!(
        h.manager.import_slots_json("not json", false).await,
        Err(LocklyError::InvalidPayload(_))
    );
}

#[tokio::test]
async fn merge_import_keeps_other_slots() {
    let h = harness(config(&["Front"])).await;
    add_enabled(&h.manager, "Alice", "1234").await;

    h.manager
        .import_slots(
            vec![SlotImport {
                slot: Some(4),
                name: Some("Carol".into()),
                ..Default::default()
            }],
            false,
        )
        .await
        .unwrap();
    let names: Vec<String> = h.manager.slots().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Alice", "Carol"]);
}

// ---------------------------------------------------------------------------
// Test: wipe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wipe_subset_removes_only_named_slots() {
    let h = harness(config(&["Front"])).await;
    for name in ["A", "B", "C"] {
        add_enabled(&h.manager, name, "1234").await;
    }

    assert_matches!(
        h.manager.wipe_slots(Some(vec![1, 7]), None, true).await,
        Err(LocklyError::SlotNotFound(7))
    );
    assert_eq!(h.manager.slots().await.len(), 3);

    h.manager.wipe_slots(Some(vec![1, 3]), None, true).await.unwrap();
    let ids: Vec<SlotId> = h.manager.slots().await.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![2]);
}

#[tokio::test]
async fn wipe_all_clears_devices() {
    let mut h = harness(config(&["Front"])).await;
    add_enabled(&h.manager, "A", "1234").await;
    add_enabled(&h.manager, "B", "5678").await;

    let manager = h.manager.clone();
    let wipe = tokio::spawn(async move { manager.wipe_slots(None, None, false).await });

    for _ in 0..2 {
        let (_, payload) = h.published.recv().await.unwrap();
        assert_eq!(payload["pin_code"]["user_enabled"], json!(false));
        handle_message(&h.manager, "zigbee2mqtt/Front/action", b"pin_code_deleted").await;
    }
    wipe.await.unwrap().unwrap();
    assert!(h.manager.slots().await.is_empty());
}

// ---------------------------------------------------------------------------
// Test: stop releases waiting callers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_releases_waiters() {
    let mut h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    let manager = h.manager.clone();
    let apply = tokio::spawn(async move { manager.apply_slot(slot_id, ApplyOptions::default()).await });
    h.published.recv().await.unwrap();

    h.manager.stop().await;
    apply.await.unwrap().unwrap();
}

#[tokio::test]
async fn apply_after_stop_is_refused() {
    let h = harness(config(&["Front"])).await;
    let slot_id = add_enabled(&h.manager, "Alice", "1234").await;

    h.manager.stop().await;
    assert_matches!(
        h.manager.apply_slot(slot_id, ApplyOptions::default()).await,
        Err(LocklyError::Stopped)
    );
    assert_matches!(
        h.manager.remove_slot(slot_id, None, false).await,
        Err(LocklyError::Stopped)
    );

    let slot = h.manager.slot(slot_id).await.unwrap();
    assert!(!slot.busy);
    assert_eq!(slot.status, SlotStatus::Idle);
    let stored = h.store.get("lockly_slots.default").await.unwrap();
    assert_eq!(stored[0]["busy"], json!(false));
}
