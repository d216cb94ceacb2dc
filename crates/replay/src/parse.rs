//! z2m log line parsing and action/state correlation.

use std::sync::LazyLock;

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use lockly_core::activity::{is_lock_action, ActivityEvent};
use lockly_core::types::{SlotId, Timestamp};
use regex::Regex;
use serde_json::Value;

use crate::ReplayError;

/// Events of one lock action on the two topics are at most this far apart.
pub const CORRELATION_WINDOW_SECS: i64 = 3;

const ACTION_SUFFIX: &str = "/action";
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(?P<ts>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\]\s+info:\s+z2m:mqtt:\s+MQTT publish:\s+topic\s+'(?P<topic>[^']+)',\s+payload\s+'(?P<payload>.*)'$",
    )
    .expect("log line pattern is valid")
});

/// How log lines are interpreted.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// z2m base MQTT topic.
    pub base_topic: String,
    /// Hours east of UTC the log timestamps are written in.
    pub tz_offset_hours: f64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            base_topic: "zigbee2mqtt".into(),
            tz_offset_hours: 0.0,
        }
    }
}

impl ReplayOptions {
    fn offset(&self) -> Result<FixedOffset, ReplayError> {
        let secs = (self.tz_offset_hours * 3600.0).round();
        if !secs.is_finite() || secs.abs() >= 86_400.0 {
            return Err(ReplayError::InvalidOffset(self.tz_offset_hours));
        }
        FixedOffset::east_opt(secs as i32).ok_or(ReplayError::InvalidOffset(self.tz_offset_hours))
    }
}

/// Topic an event was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    ActionTopic,
    StateTopic,
}

/// One event read from a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event: ActivityEvent,
    pub origin: EventOrigin,
}

/// Parse one log line. Lines that are not a lock action publish under
/// `base_topic` yield `None`.
pub fn parse_line(line: &str, base_topic: &str, offset: &FixedOffset) -> Option<ParsedEvent> {
    let caps = LINE_RE.captures(line.trim())?;
    let timestamp = parse_timestamp(&caps["ts"], offset)?;
    let rest = caps["topic"].strip_prefix(base_topic)?.strip_prefix('/')?;
    let payload = &caps["payload"];

    if let Some(lock) = rest.strip_suffix(ACTION_SUFFIX) {
        let action = payload.trim();
        if !is_lock_action(action) {
            return None;
        }
        return Some(ParsedEvent {
            event: ActivityEvent::new(lock, action, timestamp),
            origin: EventOrigin::ActionTopic,
        });
    }
    if rest.contains('/') {
        return None;
    }
    parse_state_payload(rest, payload, timestamp)
}

/// Parse all lines and correlate the result.
pub fn parse_log<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    options: &ReplayOptions,
) -> Result<Vec<ActivityEvent>, ReplayError> {
    let offset = options.offset()?;
    let parsed: Vec<ParsedEvent> = lines
        .into_iter()
        .filter_map(|line| parse_line(line, &options.base_topic, &offset))
        .collect();
    tracing::debug!(events = parsed.len(), "Parsed lock events");
    Ok(correlate(parsed))
}

/// Drop action-topic events that have a state-topic twin.
///
/// A twin has the same lock and action and lies within
/// [`CORRELATION_WINDOW_SECS`]; each state event claims at most one action
/// event. Output is sorted by timestamp, state events first on ties.
pub fn correlate(events: Vec<ParsedEvent>) -> Vec<ActivityEvent> {
    let (state, action): (Vec<_>, Vec<_>) = events
        .into_iter()
        .partition(|e| e.origin == EventOrigin::StateTopic);
    let window_ms = CORRELATION_WINDOW_SECS * 1000;
    let mut claimed = vec![false; action.len()];

    for se in &state {
        let twin = (0..action.len()).find(|&i| {
            let ae = &action[i].event;
            !claimed[i]
                && ae.lock == se.event.lock
                && ae.action == se.event.action
                && (se.event.timestamp - ae.timestamp).num_milliseconds().abs() <= window_ms
        });
        if let Some(i) = twin {
            claimed[i] = true;
        }
    }

    let mut out: Vec<ActivityEvent> = state.into_iter().map(|e| e.event).collect();
    out.extend(
        action
            .into_iter()
            .zip(claimed)
            .filter(|(_, claimed)| !claimed)
            .map(|(e, _)| e.event),
    );
    out.sort_by_key(|e| e.timestamp);
    out
}

fn parse_timestamp(raw: &str, offset: &FixedOffset) -> Option<Timestamp> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&normalized, LOG_TIMESTAMP_FORMAT).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_state_payload(lock: &str, payload: &str, timestamp: Timestamp) -> Option<ParsedEvent> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let obj = value.as_object()?;
    let action = obj.get("action")?.as_str().filter(|a| is_lock_action(a))?;

    let mut event = ActivityEvent::new(lock, action, timestamp);
    event.slot_id = obj.get("action_user").and_then(action_user);
    event.source = obj
        .get("action_source_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(ParsedEvent {
        event,
        origin: EventOrigin::StateTopic,
    })
}

/// `action_user` as an integer or an all-digit string.
fn action_user(value: &Value) -> Option<SlotId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| SlotId::try_from(n).ok()),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        _ => None,
    }
}
