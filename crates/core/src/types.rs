/// Slot identifiers are small positive integers drawn from the configured range.
pub type SlotId = u32;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
