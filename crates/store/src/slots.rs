//! Slot table persistence.
//!
//! The table is stored as a list of flat slot records, ordered by id.

use std::collections::BTreeMap;

use lockly_core::slot::Slot;
use lockly_core::types::SlotId;

use crate::{BlobStore, StoreError};

/// Load the slot table stored under `key`.
///
/// Records left busy or mid-apply by an interrupted run are reset to idle,
/// since no correlation state survives a restart. Unreadable diagnostics
/// fields load as empty; records without a usable id are skipped with a
/// warning.
pub async fn load_slots(
    store: &dyn BlobStore,
    key: &str,
) -> Result<BTreeMap<SlotId, Slot>, StoreError> {
    let mut slots = BTreeMap::new();
    let Some(doc) = store.load(key).await? else {
        return Ok(slots);
    };

    let records = match doc {
        serde_json::Value::Array(records) => records,
        other => {
            tracing::warn!(key, kind = %json_kind(&other), "Slot table is not a list, ignoring");
            return Ok(slots);
        }
    };

    let mut reset = 0usize;
    for record in records {
        match serde_json::from_value::<Slot>(record) {
            Ok(mut slot) => {
                if slot.reset_transient() {
                    reset += 1;
                }
                slots.insert(slot.id, slot);
            }
            Err(e) => tracing::warn!(key, error = %e, "Skipping malformed slot record"),
        }
    }

    tracing::info!(key, count = slots.len(), reset, "Slot table loaded");
    Ok(slots)
}

/// Persist `slots` under `key`.
pub async fn save_slots<'a>(
    store: &dyn BlobStore,
    key: &str,
    slots: impl IntoIterator<Item = &'a Slot>,
) -> Result<(), StoreError> {
    let records = slots
        .into_iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    store.save(key, &serde_json::Value::Array(records)).await
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
