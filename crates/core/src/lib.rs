//! Lockly domain core.
//!
//! Pure domain logic with no I/O: the slot model and its PIN invariant,
//! the pin-code command payload sent to locks, the activity event model,
//! the activity deduplicator and human-readable activity descriptions.

pub mod activity;
pub mod command;
pub mod dedup;
pub mod describe;
pub mod error;
pub mod slot;
pub mod types;
