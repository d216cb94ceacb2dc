//! Slot name attribution and activity store output.

use std::collections::HashMap;
use std::path::Path;

use lockly_core::activity::ActivityEvent;
use lockly_core::types::SlotId;
use lockly_store::envelope::rewrap;
use lockly_store::file::{read_json, write_json};
use lockly_store::{StoreError, ACTIVITY_STORAGE_KEY};
use serde_json::Value;

use crate::ReplayError;

/// Parse a `{"<slot id>": "<name>"}` mapping.
pub fn parse_slot_names(raw: &str) -> Result<HashMap<SlotId, String>, ReplayError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ReplayError::InvalidSlotMapping(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ReplayError::InvalidSlotMapping("expected a JSON object".into()));
    };

    let mut names = HashMap::with_capacity(map.len());
    for (key, name) in map {
        let slot_id: SlotId = key
            .trim()
            .parse()
            .map_err(|_| ReplayError::InvalidSlotMapping(format!("slot id '{key}' is not a number")))?;
        let name = match name {
            Value::String(name) => name,
            other => other.to_string(),
        };
        names.insert(slot_id, name);
    }
    Ok(names)
}

/// Set `user_name` on every event whose slot has a known name.
pub fn apply_slot_names(events: &mut [ActivityEvent], names: &HashMap<SlotId, String>) {
    for event in events {
        if let Some(name) = event.slot_id.and_then(|id| names.get(&id)) {
            event.user_name = Some(name.clone());
        }
    }
}

/// Write `events` as the payload of the activity store file at `path`.
///
/// An existing envelope keeps its metadata and key order; anything else is
/// replaced by a fresh envelope.
pub async fn write_store(path: &Path, events: &[ActivityEvent]) -> Result<(), ReplayError> {
    let existing = match read_json(path).await {
        Ok(doc) => doc,
        Err(StoreError::Serde(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "Existing store file is not JSON, replacing");
            None
        }
        Err(e) => return Err(e.into()),
    };
    let data = serde_json::to_value(events).map_err(StoreError::from)?;
    write_json(path, &rewrap(existing, ACTIVITY_STORAGE_KEY, data)).await?;
    tracing::info!(path = %path.display(), events = events.len(), "Wrote activity store");
    Ok(())
}
