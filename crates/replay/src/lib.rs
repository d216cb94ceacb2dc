//! Offline reconstruction of the Lockly activity log from z2m log files.
//!
//! z2m logs every MQTT publish it makes. Lock actions show up twice: once
//! on the action topic as a bare action name and once on the state topic
//! as JSON carrying the user slot and source. [`parse_log`] extracts both,
//! keeps the richer state event of each pair and returns the result in
//! timestamp order; [`write_store`] writes it into an activity store file.

pub mod parse;
pub mod store;

use lockly_store::StoreError;

pub use parse::{correlate, parse_line, parse_log, EventOrigin, ParsedEvent, ReplayOptions};
pub use store::{apply_slot_names, parse_slot_names, write_store};

/// Errors raised by the replay tool.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The slot name mapping is not a JSON object of id to name.
    #[error("Invalid slot mapping: {0}")]
    InvalidSlotMapping(String),

    /// The timezone offset is outside +-24 hours.
    #[error("Invalid timezone offset: {0} hours")]
    InvalidOffset(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}
