//! Activity deduplication.
//!
//! A single human action on a lock usually shows up several times in the
//! raw log: once on the action topic, once in the state snapshot, and
//! sometimes as a `manual_*` physical report next to the plain `lock` or
//! `unlock`. [`dedup`] collapses those into one canonical event.
//!
//! The transform folds each event into the last retained one when the
//! pair is redundant. Merging can make the retained event redundant with
//! its predecessor (a `manual_lock` folded into `lock` may now follow a
//! `one_touch_lock`), so the fold is repeated until a pass removes
//! nothing. Only event timestamps are consulted.

use chrono::Duration;

use crate::activity::{
    ActivityEvent, ACTION_LOCK, ACTION_MANUAL_LOCK, ACTION_MANUAL_UNLOCK, ACTION_ONE_TOUCH_LOCK,
    ACTION_UNLOCK,
};

/// Window for physical echoes and exact repeats.
pub const ECHO_WINDOW_SECS: i64 = 5;

/// Window between a `one_touch_lock` and its `lock` confirmation.
pub const ONE_TOUCH_WINDOW_SECS: i64 = 60;

const SOURCE_AUTOMATION: &str = "automation";
const AUTOMATION_SOURCES: &[&str] = &["rf", "remote"];

/// Base action reported alongside a physical one.
fn physical_base(action: &str) -> Option<&'static str> {
    match action {
        ACTION_MANUAL_LOCK => Some(ACTION_LOCK),
        ACTION_MANUAL_UNLOCK => Some(ACTION_UNLOCK),
        _ => None,
    }
}

/// Collapse redundant events. The input is left untouched.
pub fn dedup(events: &[ActivityEvent]) -> Vec<ActivityEvent> {
    let mut current = fold_pass(events);
    loop {
        let next = fold_pass(&current);
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}

fn fold_pass(events: &[ActivityEvent]) -> Vec<ActivityEvent> {
    let mut out: Vec<ActivityEvent> = Vec::with_capacity(events.len());
    for event in events {
        let merged = match out.last_mut() {
            Some(last) => try_merge(last, event),
            None => false,
        };
        if !merged {
            out.push(event.clone());
        }
    }
    out
}

/// Merge `next` into `last` when the two describe the same real action.
fn try_merge(last: &mut ActivityEvent, next: &ActivityEvent) -> bool {
    if last.lock != next.lock {
        return false;
    }
    let delta = next.timestamp - last.timestamp;
    let echo_window = Duration::seconds(ECHO_WINDOW_SECS);
    let within_echo = delta.abs() <= echo_window;

    // Physical echo, in either order.
    if within_echo {
        if physical_base(&next.action) == Some(last.action.as_str()) {
            let merged = merge_physical(last, next);
            *last = merged;
            return true;
        }
        if physical_base(&last.action) == Some(next.action.as_str()) {
            let merged = merge_physical(next, last);
            *last = merged;
            return true;
        }
    }

    // Exact repeat.
    if within_echo && last.action == next.action {
        last.backfill_from(next);
        return true;
    }

    // Deliberate one-touch lock followed by its confirmation.
    if last.action == ACTION_ONE_TOUCH_LOCK
        && next.action == ACTION_LOCK
        && delta >= Duration::zero()
        && delta <= Duration::seconds(ONE_TOUCH_WINDOW_SECS)
    {
        last.backfill_from(next);
        return true;
    }

    false
}

fn merge_physical(base: &ActivityEvent, physical: &ActivityEvent) -> ActivityEvent {
    let mut merged = base.clone();
    merged.source = match base.source.as_deref() {
        Some(src) if AUTOMATION_SOURCES.contains(&src) => Some(SOURCE_AUTOMATION.to_string()),
        Some(src) => Some(src.to_string()),
        None => physical.source.clone(),
    };
    merged.backfill_from(physical);
    merged
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::Timestamp;

    fn at(secs: i64) -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ev(lock: &str, action: &str, secs: i64) -> ActivityEvent {
        ActivityEvent::new(lock, action, at(secs))
    }

    // ---------------------------------------------------------------------
    // Physical echo
    // ---------------------------------------------------------------------

    #[test]
    fn manual_after_base_merges_with_automation_source() {
        let events = vec![
            ev("Front", "lock", 0).with_source("rf"),
            ev("Front", "manual_lock", 2).with_source("manual"),
        ];
        let out = dedup(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, "lock");
        assert_eq!(out[0].source.as_deref(), Some("automation"));
        assert_eq!(out[0].timestamp, at(0));
    }

    #[test]
    fn manual_before_base_keeps_base_identity() {
        let events = vec![
            ev("Front", "manual_unlock", 0).with_source("manual"),
            ev("Front", "unlock", 3).with_source("remote").with_slot(2),
        ];
        let out = dedup(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, "unlock");
        assert_eq!(out[0].timestamp, at(3));
        assert_eq!(out[0].source.as_deref(), Some("automation"));
        assert_eq!(out[0].slot_id, Some(2));
    }

    #[test]
    fn physical_source_fills_missing_base_source() {
        let events = vec![
            ev("Front", "unlock", 0).with_user_name("Ann"),
            ev("Front", "manual_unlock", 1).with_source("manual"),
        ];
        let out = dedup(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source.as_deref(), Some("manual"));
        assert_eq!(out[0].user_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn keypad_base_source_is_kept() {
        let events = vec![
            ev("Front", "unlock", 0).with_source("keypad"),
            ev("Front", "manual_unlock", 1).with_source("manual"),
        ];
        assert_eq!(dedup(&events)[0].source.as_deref(), Some("keypad"));
    }

    #[test]
    fn physical_echo_outside_window_is_kept() {
        let events = vec![ev("Front", "lock", 0), ev("Front", "manual_lock", 6)];
        assert_eq!(dedup(&events).len(), 2);
    }

    #[test]
    fn physical_echo_at_window_edge_merges() {
        let events = vec![ev("Front", "lock", 0), ev("Front", "manual_lock", 5)];
        assert_eq!(dedup(&events).len(), 1);
    }

    #[test]
    fn never_merges_across_locks() {
        let events = vec![
            ev("Front", "lock", 0),
            ev("Back", "manual_lock", 1),
            ev("Back", "lock", 2),
            ev("Front", "lock", 3),
        ];
        let out = dedup(&events);
        assert_eq!(out.len(), 4);
    }

    // ---------------------------------------------------------------------
    // Exact repeat / one-touch
    // ---------------------------------------------------------------------

    #[test]
    fn exact_repeat_keeps_first_and_backfills() {
        let events = vec![
            ev("Front", "unlock", 0).with_source("keypad"),
            ev("Front", "unlock", 1).with_user_name("Ann").with_slot(3),
        ];
        let out = dedup(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source.as_deref(), Some("keypad"));
        assert_eq!(out[0].user_name.as_deref(), Some("Ann"));
        assert_eq!(out[0].slot_id, Some(3));
        assert_eq!(out[0].timestamp, at(0));
    }

    #[test]
    fn unlock_then_lock_is_kept() {
        let events = vec![ev("Front", "unlock", 0), ev("Front", "lock", 1)];
        assert_eq!(dedup(&events).len(), 2);
    }

    #[test]
    fn one_touch_then_lock_within_minute_merges() {
        let events = vec![ev("Front", "one_touch_lock", 0), ev("Front", "lock", 45)];
        let out = dedup(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, "one_touch_lock");
    }

    #[test]
    fn one_touch_then_late_lock_is_kept() {
        let events = vec![ev("Front", "one_touch_lock", 0), ev("Front", "lock", 61)];
        assert_eq!(dedup(&events).len(), 2);
    }

    #[test]
    fn lock_before_one_touch_is_kept() {
        let events = vec![ev("Front", "lock", 0), ev("Front", "one_touch_lock", 10)];
        assert_eq!(dedup(&events).len(), 2);
    }

    #[test]
    fn cascading_merge_reaches_fixpoint() {
        // manual_lock folds into lock, which then confirms the one-touch.
        let events = vec![
            ev("Front", "one_touch_lock", 0),
            ev("Front", "manual_lock", 20),
            ev("Front", "lock", 22).with_slot(1),
        ];
        let once = dedup(&events);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].action, "one_touch_lock");
        assert_eq!(once[0].slot_id, Some(1));
    }

    #[test]
    fn dedup_is_idempotent() {
        let events = vec![
            ev("Front", "unlock", 0).with_source("keypad").with_slot(2),
            ev("Front", "unlock", 1),
            ev("Front", "manual_unlock", 3).with_source("manual"),
            ev("Back", "lock", 4).with_source("rf"),
            ev("Back", "manual_lock", 5),
            ev("Front", "one_touch_lock", 30),
            ev("Front", "lock", 50),
            ev("Front", "lock", 200),
            ev("Front", "unlock", 201),
        ];
        let once = dedup(&events);
        let twice = dedup(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn input_is_not_mutated() {
        let events = vec![ev("Front", "unlock", 0), ev("Front", "unlock", 1).with_slot(4)];
        let before = events.clone();
        let _ = dedup(&events);
        assert_eq!(events, before);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(dedup(&[]).is_empty());
    }
}
